use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::device::{DecodeCallbacks, DecodeDevice, DecoderConfig};
use crate::error::{ErrorLatch, PipelineError};
use crate::frame::VideoFrame;
use crate::packet::CodedChunk;
use crate::queue::BlockingQueue;
use crate::serial::SerialQueue;

/// Frames buffered between the decode device and its consumer.
pub const FRAME_QUEUE_SIZE: usize = 2;

/// Running decode stage: coded chunks in, raw frames out.
pub struct DecoderStage {
    pub frames: Arc<BlockingQueue<VideoFrame>>,
    pub done: JoinHandle<()>,
}

/// Configures `device` and spawns the decode loop.
///
/// Decoded frames land on the returned bounded queue. When the queue runs
/// out of spare capacity the loop stops feeding chunks until the consumer
/// frees a slot, so a slow consumer throttles the device instead of letting
/// frames pile up in memory.
pub fn start_decoder(
    device: Box<dyn DecodeDevice>,
    config: DecoderConfig,
    chunks: Arc<BlockingQueue<CodedChunk>>,
    latch: ErrorLatch,
) -> DecoderStage {
    let frames = Arc::new(BlockingQueue::new(FRAME_QUEUE_SIZE));
    let done = tokio::spawn(run_decoder(device, config, chunks, frames.clone(), latch));
    DecoderStage { frames, done }
}

async fn run_decoder(
    mut device: Box<dyn DecodeDevice>,
    config: DecoderConfig,
    chunks: Arc<BlockingQueue<CodedChunk>>,
    frames: Arc<BlockingQueue<VideoFrame>>,
    latch: ErrorLatch,
) {
    // Frame pushes run serialized so they land in decode order even though
    // each one is spawned from a synchronous device callback.
    let serial = SerialQueue::with_timeout_millis(0);
    let (pause_tx, mut pause_rx) = watch::channel(false);
    let pause_tx = Arc::new(pause_tx);

    {
        let pause_tx = pause_tx.clone();
        frames.set_spare_capacity_hook(move |_spare| {
            pause_tx.send_replace(false);
        });
    }

    let callbacks = DecodeCallbacks {
        output: Box::new({
            let serial = serial.clone();
            let frames = frames.clone();
            let pause_tx = pause_tx.clone();
            move |frame: VideoFrame| {
                let frames = frames.clone();
                let pause_tx = pause_tx.clone();
                let _ = serial.enqueue(async move {
                    if frames.spare_capacity() == 0 {
                        pause_tx.send_replace(true);
                    }
                    if frames.push(frame).await.is_err() {
                        log::debug!("frame queue closed under the decoder");
                    }
                    pause_tx.send_replace(false);
                });
            }
        }),
        error: Box::new({
            let latch = latch.clone();
            move |error| latch.trip(PipelineError::Device(error))
        }),
    };

    if let Err(error) = device.configure(config, callbacks) {
        latch.trip(PipelineError::Device(error));
        chunks.close();
        frames.close();
        return;
    }

    let eof = 'feed: loop {
        while !*pause_rx.borrow() {
            let chunk = tokio::select! {
                _ = latch.cancelled() => break 'feed false,
                chunk = chunks.pull() => chunk,
            };
            match chunk {
                Some(chunk) => device.decode(chunk),
                None => break 'feed true,
            }
        }

        let resumed = tokio::select! {
            _ = latch.cancelled() => false,
            changed = pause_rx.wait_for(|paused| !paused) => changed.is_ok(),
        };
        if !resumed {
            break false;
        }
    };

    if eof {
        tokio::select! {
            _ = latch.cancelled() => {}
            flushed = device.flush() => {
                if let Err(error) = flushed {
                    latch.trip(PipelineError::Device(error));
                }
            }
        }
    } else {
        // Torn down mid-stream: stop the feeder as well.
        chunks.close();
    }

    // Close behind any frame pushes the device already emitted. On
    // cancellation close directly so a suspended push cannot wedge us.
    let close = serial.enqueue({
        let frames = frames.clone();
        async move { frames.close() }
    });
    tokio::select! {
        _ = latch.cancelled() => frames.close(),
        _ = close => {}
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
