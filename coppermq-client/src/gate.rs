use crate::consumer::{ConsumeOptions, ConsumerCallback};
use crate::model::QueueSlot;
use crate::processor::ReplySink;
use coppermq_codec::frame::{self, AMQPFrame, ClassMethod};
use std::collections::VecDeque;

/// State machine action attached to a synchronous request, executed when
/// the matching reply arrives. Carrying the parameters in an enum keeps
/// the engine free of stored closures.
pub(crate) enum OnReply {
    Ignore,
    ConnectionOpened,
    ConnectionClosed,
    ChannelOpened,
    ChannelClosed,
    ExchangeDeclared,
    QueueDeclared { slot: QueueSlot },
    QueueBound { slot: QueueSlot },
    ConsumeStarted { slot: QueueSlot, consumer: PendingConsumer },
    ConsumerCancelled,
}

/// Consumer registration waiting for its `ConsumeOk`.
pub(crate) struct PendingConsumer {
    pub(crate) callback: ConsumerCallback,
    pub(crate) opts: ConsumeOptions,
}

/// An outbound batch submitted for admission: the frames, the reply action
/// if the leading frame is synchronous, and an optional completion signal.
pub(crate) struct SyncBatch {
    pub(crate) frames: Vec<AMQPFrame>,
    pub(crate) on_reply: OnReply,
    pub(crate) done: Option<ReplySink>,
}

impl SyncBatch {
    pub(crate) fn new(frames: Vec<AMQPFrame>) -> Self {
        Self {
            frames,
            on_reply: OnReply::Ignore,
            done: None,
        }
    }

    pub(crate) fn on_reply(mut self, on_reply: OnReply) -> Self {
        self.on_reply = on_reply;
        self
    }

    pub(crate) fn done(mut self, done: Option<ReplySink>) -> Self {
        self.done = done;
        self
    }
}

/// The currently outstanding synchronous exchange on a channel.
pub(crate) struct PendingSync {
    pub(crate) request: ClassMethod,
    pub(crate) responses: &'static [ClassMethod],
    pub(crate) on_reply: OnReply,
    pub(crate) done: Option<ReplySink>,
}

/// A batch cleared for the wire. For synchronous batches the completion
/// signal stays with the gate entry and fires on the reply instead.
pub(crate) struct Admitted {
    pub(crate) frames: Vec<AMQPFrame>,
    pub(crate) done: Option<ReplySink>,
}

/// Serializes synchronous method exchanges on one channel.
///
/// At most one synchronous request is outstanding at a time; competing
/// batches wait in `process_after` and are re-admitted in FIFO order when
/// the reply lands. All synchronous requests are serialized, not only the
/// ones with overlapping reply classes: some brokers reject overlapping
/// synchronous exchanges on a channel.
#[derive(Default)]
pub(crate) struct SyncGate {
    active: Option<PendingSync>,
    process_after: VecDeque<SyncBatch>,
}

impl SyncGate {
    pub(crate) fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Admit a batch. Returns the frames to put on the wire now, or `None`
    /// when the batch has to wait for the outstanding exchange.
    pub(crate) fn admit(&mut self, batch: SyncBatch) -> Option<Admitted> {
        let request = batch
            .frames
            .first()
            .and_then(|f| f.class_method())
            .filter(|cm| frame::is_synchronous(*cm));

        match request {
            None => Some(Admitted {
                frames: batch.frames,
                done: batch.done,
            }),
            Some(request) => {
                if self.active.is_some() {
                    self.process_after.push_back(batch);
                    return None;
                }

                self.active = Some(PendingSync {
                    request,
                    responses: frame::response_classes(request),
                    on_reply: batch.on_reply,
                    done: batch.done,
                });

                Some(Admitted {
                    frames: batch.frames,
                    done: None,
                })
            }
        }
    }

    /// Settle the outstanding exchange with an inbound reply class. Returns
    /// the gate entry when the reply belongs to it.
    pub(crate) fn settle(&mut self, response: ClassMethod) -> Option<PendingSync> {
        if self
            .active
            .as_ref()
            .map(|pending| pending.responses.contains(&response))
            .unwrap_or(false)
        {
            self.active.take()
        } else {
            None
        }
    }

    /// Next deferred batch to re-admit, as long as the gate is free.
    pub(crate) fn release_next(&mut self) -> Option<SyncBatch> {
        if self.active.is_some() {
            None
        } else {
            self.process_after.pop_front()
        }
    }

    /// Drop the outstanding exchange and all deferred batches. Used on
    /// disconnect; the deferred work is not replayed, callers re-queue from
    /// a reconnect hook.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.process_after.len() + usize::from(self.active.is_some());

        self.active = None;
        self.process_after.clear();

        dropped
    }
}
