use parking_lot::Mutex;

/// The hard cap on any flow-control window. Update deltas are accumulated in
/// u64 and clamped here, so a malicious peer cannot overflow the accounting.
pub const MAX_WINDOW: u64 = 16 * 1024 * 1024;

/// The wire-implied initial window for every stream.
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// How many bytes we may still send on one stream before the peer must grant
/// more. Writers park on `take` until credit arrives.
pub(crate) struct SendWindow {
    avail: Mutex<u64>,
    grown: async_event::Event,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            avail: Mutex::new(initial as u64),
            grown: async_event::Event::new(),
        }
    }

    pub fn grow(&self, delta: u32) {
        {
            let mut avail = self.avail.lock();
            *avail = (*avail + delta as u64).min(MAX_WINDOW);
        }
        self.grown.notify_all();
    }

    /// Waits until at least one byte of credit exists, then claims up to
    /// `want` bytes of it.
    pub async fn take(&self, want: usize) -> usize {
        self.grown
            .wait_until(|| {
                let mut avail = self.avail.lock();
                if *avail == 0 {
                    None
                } else {
                    let n = (*avail).min(want as u64) as usize;
                    *avail -= n as u64;
                    Some(n)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn take_blocks_until_grown() {
        smolscale::block_on(async {
            let window = Arc::new(SendWindow::new(0));
            let taker = {
                let window = window.clone();
                smolscale::spawn(async move { window.take(100).await })
            };
            async_io::Timer::after(std::time::Duration::from_millis(10)).await;
            window.grow(40);
            assert_eq!(taker.await, 40);
        })
    }

    #[test]
    fn grow_saturates_at_max() {
        smolscale::block_on(async {
            let window = SendWindow::new(u32::MAX);
            window.grow(u32::MAX);
            window.grow(u32::MAX);
            assert_eq!(window.take(usize::MAX).await, MAX_WINDOW as usize);
        })
    }
}
