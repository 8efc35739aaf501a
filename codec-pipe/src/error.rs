use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::device::DeviceError;
use crate::queue::QueueClosed;
use crate::serial::SerialError;
use crate::sps::SpsError;

/// Terminal pipeline failure. One run surfaces at most one of these;
/// whichever stage fails first wins and everything else is torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("bitstream ended before a sequence parameter set was found")]
    MissingParameterSet,

    #[error("invalid sequence parameter set: {0}")]
    InvalidParameterSet(#[from] SpsError),

    #[error("no video track in container")]
    MissingVideoTrack,

    #[error("demuxer stopped before producing a configuration")]
    DemuxerStopped,

    #[error("encoder still reports {pending} pending frames after a flush (low water mark {low_water})")]
    EncoderClogged { pending: usize, low_water: usize },

    #[error("device failed: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Queue(#[from] QueueClosed),

    #[error(transparent)]
    Serial(#[from] SerialError),
}

/// First-error latch shared by every stage of a pipeline.
///
/// The first stage to trip the latch records its error and cancels the
/// shared token; later errors are logged and dropped. Stage loops select
/// on [`ErrorLatch::cancelled`] so one failure tears the whole run down.
#[derive(Clone, Default)]
pub struct ErrorLatch {
    first: Arc<Mutex<Option<PipelineError>>>,
    cancel: CancellationToken,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the error if none has been recorded yet and cancels the run.
    pub fn trip(&self, error: PipelineError) {
        {
            let mut first = self.first.lock().unwrap();
            match &*first {
                None => {
                    log::error!("pipeline failed: {error}");
                    *first = Some(error);
                }
                Some(_) => log::debug!("pipeline already failed, dropping: {error}"),
            }
        }
        self.cancel.cancel();
    }

    /// Cancels the run without recording an error.
    pub fn shut_down(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The recorded error, if any stage has tripped the latch.
    pub fn error(&self) -> Option<PipelineError> {
        self.first.lock().unwrap().clone()
    }

    /// Resolves the run: `Ok` when no stage tripped the latch.
    pub fn result(&self) -> Result<(), PipelineError> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
