use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::classifier::ActionableMessage;
use super::handler::{PipelineOutcome, ReplyPipeline};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Reply queue is full")]
    Full,

    #[error("Reply queue is closed")]
    Closed,
}

/// A unit of reply work handed off by the webhook.
#[derive(Debug, Clone)]
pub struct ReplyJob {
    pub message: ActionableMessage,
}

/// Queue between the webhook and the reply workers.
///
/// Pushing never waits: a full queue is reported to the caller so the HTTP
/// path can answer immediately.
pub struct ReplyBus {
    sender: Sender<ReplyJob>,
    receiver: Arc<Mutex<Receiver<ReplyJob>>>,
}

impl ReplyBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<ReplyJob>>> {
        self.receiver.clone()
    }

    pub fn push(&self, job: ReplyJob) -> Result<(), BusError> {
        self.sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => BusError::Full,
            TrySendError::Closed(_) => BusError::Closed,
        })
    }
}

/// Drain the bus, running each job on its own task.
///
/// At most `max_in_flight` jobs run at once. The next job is only taken off
/// the queue once a slot frees up, so a backlog fills the queue and the
/// webhook starts refusing work. Outcomes are forwarded to `observer` when
/// one is given; a dropped observer is ignored.
pub async fn reply_loop(
    receiver: Arc<Mutex<Receiver<ReplyJob>>>,
    pipeline: Arc<ReplyPipeline>,
    max_in_flight: usize,
    observer: Option<UnboundedSender<PipelineOutcome>>,
) {
    let mut rx = receiver.lock().await;
    let slots = Arc::new(Semaphore::new(max_in_flight.max(1)));
    info!("Reply worker started ({} concurrent replies)", max_in_flight.max(1));

    loop {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let Some(job) = rx.recv().await else {
            break;
        };

        let pipeline = pipeline.clone();
        let observer = observer.clone();
        debug!("Dispatching reply for chat {}", job.message.chat_id);

        tokio::spawn(async move {
            let _permit = permit;
            let message = job.message;
            let outcome = pipeline
                .run(&message.chat_id, message.sender_id.as_deref(), &message.text)
                .await;
            if let Some(tx) = observer {
                if tx.send(outcome).is_err() {
                    warn!("Pipeline outcome observer dropped");
                }
            }
        });
    }

    info!("Reply worker stopped");
}
