use super::*;

/// Capacity of the coordinator's signal channel.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMessage {
    /// Shut the control loop down.
    Stop,
    /// The task persisted its snapshot for the barrier.
    Ack,
    /// The task failed to persist its snapshot.
    Dec,
}

/// Message from a task (or the coordinator itself) to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub message: SignalMessage,
    pub barrier: Barrier,
}

/// Cloneable sending half of the signal channel.
#[derive(Debug, Clone)]
pub struct SignalSender {
    sender: mpsc::Sender<Signal>,
}

impl SignalSender {
    pub async fn ack(&self, barrier: Barrier) -> Result<()> {
        self.send(Signal {
            message: SignalMessage::Ack,
            barrier,
        })
        .await
    }

    pub async fn decline(&self, barrier: Barrier) -> Result<()> {
        self.send(Signal {
            message: SignalMessage::Dec,
            barrier,
        })
        .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Signal {
            message: SignalMessage::Stop,
            barrier: Barrier::default(),
        })
        .await
    }

    async fn send(&self, signal: Signal) -> Result<()> {
        self.sender
            .send(signal)
            .await
            .map_err(|_| anyhow!("signal channel closed: coordinator stopped"))
    }
}

pub type SignalReceiver = mpsc::Receiver<Signal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    let (sender, receiver) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    (SignalSender { sender }, receiver)
}
