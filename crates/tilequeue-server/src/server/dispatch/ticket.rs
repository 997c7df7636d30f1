use crate::server::dispatch::actor::Command;
use tilequeue::{Error, Fingerprint, SequenceId};
use tokio::sync::{mpsc, oneshot};

/// How a request left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Response headers arrived from the backend.
    Forwarded,
    BackendError,
    /// The handler was dropped, which is how hyper reports a closed client.
    Disconnected,
}

/// A handler's claim on one request's scheduling state.
///
/// Completing is one-shot: the first [`complete`](Self::complete) sends the
/// notice, later calls and the drop do nothing. A ticket dropped without
/// completing reports [`Outcome::Disconnected`], so a cancelled handler
/// always releases its slot or leaves its queue.
pub(crate) struct Ticket {
    fingerprint: Fingerprint,
    id: SequenceId,
    commands: mpsc::UnboundedSender<Command>,
    admission: Option<oneshot::Receiver<()>>,
    completed: bool,
}

impl Ticket {
    pub(super) fn new(
        fingerprint: Fingerprint,
        id: SequenceId,
        commands: mpsc::UnboundedSender<Command>,
        admission: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            fingerprint,
            id,
            commands,
            admission: Some(admission),
            completed: false,
        }
    }

    pub(crate) const fn id(&self) -> SequenceId {
        self.id
    }

    /// Waits until the scheduler grants this request a slot.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] if the dispatcher stopped first, or if the
    /// grant was already consumed.
    pub(crate) async fn admitted(&mut self) -> Result<(), Error> {
        let admission = self.admission.take().ok_or(Error::ServiceShutdown)?;
        admission.await.map_err(|_| Error::ServiceShutdown)
    }

    pub(crate) fn complete(&mut self, outcome: Outcome) {
        if self.completed {
            return;
        }
        self.completed = true;
        // A closed channel means the dispatcher is gone along with the slot.
        let _ = self.commands.send(Command::Complete {
            fingerprint: self.fingerprint.clone(),
            id: self.id,
            outcome,
        });
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.complete(Outcome::Disconnected);
    }
}
