//! Ordering handshake between batch producer and consumer.
use tch::Device;

/// Completion marker for the asynchronous work issued while building a
/// batch.
///
/// The collator returns immediately after issuing transfers and augmentation
/// kernels; the training step must call [`TransferEvent::wait`] before
/// reading batch contents. On CPU devices all work is synchronous and
/// waiting is a no-op.
#[derive(Debug, Clone, Copy)]
pub struct TransferEvent {
    device: Device,
}

impl TransferEvent {
    pub(crate) fn record(device: Device) -> Self {
        Self { device }
    }

    /// Device the batch was issued on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Blocks until every kernel and copy issued before this event has
    /// completed on the batch's device.
    pub fn wait(&self) {
        if let Device::Cuda(index) = self.device {
            tch::Cuda::synchronize(index as i64);
        }
    }
}
