use {
    crate::sensors::Measurement,
    async_channel::{Receiver, Sender, TrySendError},
    log::warn,
    serde::{Deserialize, Serialize},
};

/// What the poller delivers to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    LiveSensorData(Measurement),
}

impl Message {
    pub fn measurement(&self) -> &Measurement {
        match self {
            Message::LiveSensorData(m) => m,
        }
    }
}

/// Unbounded, ordered queue between the poller and its consumers.
///
/// Clones share the same queue. Any number of consumers may take messages
/// through [`DataSink::receiver`]; each message is delivered to exactly one of
/// them.
#[derive(Debug, Clone)]
pub struct DataSink {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl DataSink {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, message: Message) {
        // The sink holds its own receiver, so the queue is never closed.
        if let Err(TrySendError::Closed(message) | TrySendError::Full(message)) =
            self.tx.try_send(message)
        {
            warn!(
                "Dropping message for sensor {}: sink rejected it",
                message.measurement().sensor_id
            );
        }
    }

    pub fn receiver(&self) -> Receiver<Message> {
        self.rx.clone()
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Takes every message queued so far.
    pub fn drain(&self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for DataSink {
    fn default() -> Self {
        Self::new()
    }
}
