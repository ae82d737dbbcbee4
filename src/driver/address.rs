use std::net::{Ipv4Addr, SocketAddrV4};
use anyhow::bail;

/// Completes a partial numeric address from the local address, so that on a LAN it is enough
///  to type the trailing octets: with a local address of 192.168.1.20, `"7"` becomes
///  192.168.1.7 and `"2.7:27001"` becomes 192.168.2.7 port 27001. A leading dot is allowed
///  (`".7"`). Each given octet replaces one octet from the right.
pub fn complete_partial_ipv4(input: &str, local: Ipv4Addr, default_port: u16) -> anyhow::Result<SocketAddrV4> {
    let (addr_part, port_part) = match input.split_once(':') {
        Some((a, p)) => (a, Some(p)),
        None => (input, None),
    };

    let addr_part = addr_part.strip_prefix('.').unwrap_or(addr_part);

    let mut num_octets = 0u32;
    let mut addr = 0u32;
    for octet in addr_part.split('.') {
        if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
            bail!("{} is not a valid partial address", input);
        }
        let value: u32 = octet.parse()?;
        if value > 255 {
            bail!("{} is not a valid partial address", input);
        }
        num_octets += 1;
        if num_octets > 4 {
            bail!("{} has too many address components", input);
        }
        addr = (addr << 8) | value;
    }

    let mask = u32::MAX.checked_shl(8 * num_octets).unwrap_or(0);
    let ip = Ipv4Addr::from((u32::from(local) & mask) | addr);

    let port = match port_part {
        Some(p) => p.trim().parse::<u16>()?,
        None => default_port,
    };

    Ok(SocketAddrV4::new(ip, port))
}

/// Splits `host[:port]` for symbolic host names.
pub fn split_host_port(input: &str, default_port: u16) -> anyhow::Result<(&str, u16)> {
    match input.rsplit_once(':') {
        Some((host, port)) => Ok((host, port.parse()?)),
        None => Ok((input, default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::last_octet("7", "192.168.1.7:26000")]
    #[case::two_octets("2.7", "192.168.2.7:26000")]
    #[case::leading_dot(".7", "192.168.1.7:26000")]
    #[case::with_port("2.7:27001", "192.168.2.7:27001")]
    #[case::full("10.1.2.3", "10.1.2.3:26000")]
    #[case::full_with_port("10.1.2.3:5", "10.1.2.3:5")]
    fn test_complete(#[case] input: &str, #[case] expected: &str) {
        let local = Ipv4Addr::new(192, 168, 1, 20);
        let addr = complete_partial_ipv4(input, local, 26000).unwrap();
        assert_eq!(addr, expected.parse::<SocketAddrV4>().unwrap());
    }

    #[rstest]
    #[case::four_digits("1234")]
    #[case::too_big("256")]
    #[case::five_octets("1.2.3.4.5")]
    #[case::letters("1.a")]
    #[case::empty_octet("1..2")]
    #[case::bad_port("1.2:x")]
    #[case::empty("")]
    fn test_complete_rejects(#[case] input: &str) {
        assert!(complete_partial_ipv4(input, Ipv4Addr::LOCALHOST, 26000).is_err());
    }

    #[rstest]
    #[case("server", "server", 26000)]
    #[case("server:27500", "server", 27500)]
    fn test_split_host_port(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        assert_eq!(split_host_port(input, 26000).unwrap(), (host, port));
    }
}
