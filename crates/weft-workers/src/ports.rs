use std::collections::BTreeSet;
use tracing::debug;
use weft_core::{WeftError, WeftResult};

/// Reservation set over a fixed, inclusive port range.
///
/// A port handed out by [`PortPool::acquire`] stays reserved until
/// [`PortPool::release`] is called, so two running workers never share one.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    reserved: parking_lot::Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> WeftResult<Self> {
        if start > end {
            return Err(WeftError::Config(format!(
                "Port range start {start} is above end {end}"
            )));
        }
        Ok(Self {
            start,
            end,
            reserved: parking_lot::Mutex::new(BTreeSet::new()),
        })
    }

    /// Reserve and return the lowest free port.
    pub fn acquire(&self) -> WeftResult<u16> {
        let mut reserved = self.reserved.lock();
        let port = (self.start..=self.end)
            .find(|port| !reserved.contains(port))
            .ok_or(WeftError::PortsExhausted {
                start: self.start,
                end: self.end,
            })?;
        reserved.insert(port);
        debug!(port, "Port reserved");
        Ok(port)
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "Port released");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_free_port_then_exhaustion() {
        let pool = PortPool::new(3100, 3102).unwrap();
        assert_eq!(pool.acquire().unwrap(), 3100);
        assert_eq!(pool.acquire().unwrap(), 3101);
        assert_eq!(pool.acquire().unwrap(), 3102);
        let err = pool.acquire().unwrap_err();
        assert!(matches!(
            err,
            WeftError::PortsExhausted {
                start: 3100,
                end: 3102
            }
        ));
    }

    #[test]
    fn test_released_port_is_reused_first() {
        let pool = PortPool::new(3100, 3199).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        assert!(!pool.is_reserved(a));
        assert!(pool.is_reserved(b));
        assert_eq!(pool.acquire().unwrap(), a);
        assert_eq!(pool.reserved_count(), 2);
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(matches!(
            PortPool::new(10, 9).unwrap_err(),
            WeftError::Config(_)
        ));
    }
}
