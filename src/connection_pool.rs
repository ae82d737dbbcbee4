use std::time::Instant;
use tracing::trace;
use crate::connection::{Connection, ConnectionId};
use crate::error::PoolError;

/// Fixed set of connection slots, allocated once. Slots move between the free list and the
///  active list but are never created or destroyed after construction. Each release bumps the
///  slot's generation, which invalidates all [ConnectionId]s handed out for it.
pub struct ConnectionPool {
    slots: Vec<Connection>,
    /// NB: popped from the end, so it is initialized in reverse to hand out slot 0 first
    free: Vec<usize>,
    /// in acquisition order
    active: Vec<usize>,
    max_active: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize, now: Instant) -> ConnectionPool {
        ConnectionPool {
            slots: (0..capacity).map(|_| Connection::new(now)).collect(),
            free: (0..capacity).rev().collect(),
            active: Vec::with_capacity(capacity),
            max_active: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Limits the number of active connections, bounded by the pool's capacity. Lowering the
    ///  limit below the current number of active connections does not close any of them, it
    ///  only prevents new ones.
    pub fn set_max_active(&mut self, max_active: usize) {
        self.max_active = max_active.clamp(1, self.capacity());
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<ConnectionId> {
        self.active.iter()
            .map(|&index| self.id_of(index))
            .collect()
    }

    fn id_of(&self, index: usize) -> ConnectionId {
        ConnectionId {
            index: index as u32,
            generation: self.slots[index].generation,
        }
    }

    /// Takes a connection from the free list and resets it to its initial state. The caller
    ///  is expected to set the endpoint right away.
    pub fn acquire(&mut self, now: Instant) -> Result<ConnectionId, PoolError> {
        if self.active.len() >= self.max_active {
            return Err(PoolError::NoCapacity);
        }
        let Some(index) = self.free.pop() else {
            return Err(PoolError::NoCapacity);
        };

        let conn = &mut self.slots[index];
        conn.reset(now);
        conn.active = true;
        self.active.push(index);

        let id = self.id_of(index);
        trace!("acquired connection {}", id);
        Ok(id)
    }

    /// Returns the connection's slot to the free list. The connection's endpoint is returned so
    ///  the caller can close the socket.
    pub fn release(&mut self, id: ConnectionId) -> Result<Connection, PoolError> {
        if self.get(id).is_none() {
            return Err(PoolError::NotActive);
        }
        let index = id.index as usize;
        self.active.retain(|&i| i != index);

        let now = self.slots[index].connect_time;
        let mut released = Connection::new(now);
        std::mem::swap(&mut released, &mut self.slots[index]);

        let slot = &mut self.slots[index];
        slot.generation = released.generation.wrapping_add(1);
        slot.active = false;
        released.active = false;

        self.free.push(index);
        trace!("released connection {}", id);
        Ok(released)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots.get(id.index as usize)
            .filter(|conn| conn.active && conn.generation == id.generation)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots.get_mut(id.index as usize)
            .filter(|conn| conn.active && conn.generation == id.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;

    #[test]
    fn test_acquire_until_full() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(2, now);

        let a = pool.acquire(now).unwrap();
        let b = pool.acquire(now).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.acquire(now), Err(PoolError::NoCapacity));
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.active_ids(), vec![a, b]);
    }

    #[test]
    fn test_release_and_reuse() {
        let start = Instant::now();
        let mut pool = ConnectionPool::new(1, start);

        let first = pool.acquire(start).unwrap();
        pool.get_mut(first).unwrap().address = "somewhere".to_string();
        assert!(pool.release(first).is_ok());
        assert_eq!(pool.release(first).err(), Some(PoolError::NotActive));
        assert!(pool.get(first).is_none());

        let later = start + Duration::from_secs(3);
        let second = pool.acquire(later).unwrap();
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert!(pool.get(first).is_none());

        let conn = pool.get(second).unwrap();
        assert_eq!(conn.address, "");
        assert_eq!(conn.connect_time, later);
        assert!(conn.sender.can_send());
        assert_eq!(conn.sender.send_sequence(), 0);
        assert_eq!(conn.receiver.receive_sequence(), 0);
    }

    #[test]
    fn test_release_returns_connection() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(1, now);
        let id = pool.acquire(now).unwrap();
        pool.get_mut(id).unwrap().address = "peer".to_string();

        let released = pool.release(id).unwrap();
        assert_eq!(released.address, "peer");
        assert!(!released.active);
    }

    #[rstest]
    #[case::lower(4, 2, 2)]
    #[case::capped_by_capacity(4, 9, 4)]
    #[case::at_least_one(4, 0, 1)]
    fn test_max_active(#[case] capacity: usize, #[case] max_active: usize, #[case] expected: usize) {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(capacity, now);
        pool.set_max_active(max_active);
        assert_eq!(pool.max_active(), expected);

        for _ in 0..expected {
            pool.acquire(now).unwrap();
        }
        assert_eq!(pool.acquire(now), Err(PoolError::NoCapacity));
    }

    #[test]
    fn test_lowering_max_active_keeps_connections() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(3, now);
        let a = pool.acquire(now).unwrap();
        let b = pool.acquire(now).unwrap();

        pool.set_max_active(1);
        assert!(pool.get(a).is_some());
        assert!(pool.get(b).is_some());
        assert_eq!(pool.acquire(now), Err(PoolError::NoCapacity));

        pool.release(a).unwrap();
        assert_eq!(pool.acquire(now), Err(PoolError::NoCapacity));
        pool.release(b).unwrap();
        assert!(pool.acquire(now).is_ok());
    }
}
