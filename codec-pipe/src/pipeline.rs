//! End-to-end wiring: a demuxed stream feeds a decode stage which feeds an
//! encode stage. One error latch spans all of it, so whichever stage fails
//! first cancels the rest and is the error the caller sees.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bitstream::DemuxedStream;
use crate::decoder::start_decoder;
use crate::device::{DecodeDevice, EncodeDevice, EncoderConfig};
use crate::encoder::{start_encoder, EncodingHook, UncloggingMethod};
use crate::error::{ErrorLatch, PipelineError};
use crate::packet::EncodedPacket;
use crate::queue::BlockingQueue;

/// A running transcode: pull re-encoded packets from `packets`, then call
/// [`Pipeline::finish`] to join the stages and collect the outcome.
pub struct Pipeline {
    pub packets: Arc<BlockingQueue<EncodedPacket>>,
    pub latch: ErrorLatch,
    decoder: JoinHandle<()>,
    encoder: JoinHandle<()>,
}

impl Pipeline {
    /// Waits for both stages to wind down and reports the first error any
    /// stage recorded.
    pub async fn finish(self) -> Result<(), PipelineError> {
        let _ = self.decoder.await;
        let _ = self.encoder.await;
        self.latch.result()
    }

    /// Aborts the run without recording an error.
    pub fn shut_down(&self) {
        self.latch.shut_down();
    }
}

/// Resolves the demuxed configuration, then starts the decode and encode
/// stages against it.
///
/// Fails up front when the demuxer rejects the configuration; everything
/// after that surfaces through the returned pipeline's latch.
pub async fn start_pipeline(
    input: DemuxedStream,
    decode_device: Box<dyn DecodeDevice>,
    encode_device: Box<dyn EncodeDevice>,
    encoder_config: EncoderConfig,
    unclogging: UncloggingMethod,
    on_encoding: Option<EncodingHook>,
) -> Result<Pipeline, PipelineError> {
    let config = match input.config.await {
        Ok(Ok(config)) => config,
        Ok(Err(error)) => {
            input.chunks.close();
            return Err(error);
        }
        Err(_) => {
            input.chunks.close();
            return Err(PipelineError::DemuxerStopped);
        }
    };
    log::info!(
        "transcoding {} {}x{} to {} {}x{}",
        config.codec,
        config.coded_width,
        config.coded_height,
        encoder_config.codec,
        encoder_config.width,
        encoder_config.height
    );

    let latch = ErrorLatch::new();
    let decoder = start_decoder(decode_device, config, input.chunks, latch.clone());
    let encoder = start_encoder(
        encode_device,
        encoder_config,
        unclogging,
        decoder.frames.clone(),
        on_encoding,
        latch.clone(),
    );

    Ok(Pipeline {
        packets: encoder.packets.clone(),
        latch,
        decoder: decoder.done,
        encoder: encoder.done,
    })
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
