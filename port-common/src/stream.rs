//! Incremental decoding of a keyed JSON object.
//!
//! A document of the form `{ "<key>": <record>, ... }` is parsed one pair at a time and each
//! pair is handed over a single-slot channel, so the producer can never run more than one record
//! ahead of whoever is consuming `Entries`.
use std::fmt;
use std::io::Read;
use std::marker::PhantomData;

use serde::de::{self, DeserializeOwned, DeserializeSeed, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Enumeration of errors that terminate a JsonStream.
/// Element indices start at 1 and follow document order.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("expected opening delimiter: {error}")]
    OpeningDelimiter { error: serde_json::Error },
    #[error("decode element {index}: {error}")]
    Element {
        index: usize,
        error: serde_json::Error,
    },
    #[error("expected closing delimiter: {error}")]
    ClosingDelimiter { error: serde_json::Error },
    #[error("unexpected content after closing delimiter: {error}")]
    TrailingContent { error: serde_json::Error },
}

/// One unit produced by a JsonStream. A `Failed` entry is always the last one.
#[derive(Debug)]
pub enum Entry<R> {
    Record { key: String, record: R },
    Failed(DecodeError),
}

/// What to do with bytes found after the closing delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingContent {
    #[default]
    Ignore,
    Reject,
}

/// Producer half of a streaming decode. `start` consumes it, so every instance parses exactly one
/// source, and the channel closes when it returns.
pub struct JsonStream<R> {
    sender: mpsc::Sender<Entry<R>>,
    trailing: TrailingContent,
}

/// Consumer half of a streaming decode. Entries are only parsed as fast as they are received.
pub struct Entries<R> {
    receiver: mpsc::Receiver<Entry<R>>,
}

impl<R> Entries<R> {
    /// Wait for the next entry. Returns `None` once the producer is done.
    pub async fn recv(&mut self) -> Option<Entry<R>> {
        self.receiver.recv().await
    }

    /// Blocking variant of `recv`, for consumers running outside of an async context.
    pub fn blocking_recv(&mut self) -> Option<Entry<R>> {
        self.receiver.blocking_recv()
    }
}

impl<R> JsonStream<R>
where
    R: DeserializeOwned,
{
    /// Create a decoder and the sequence of entries it will feed.
    pub fn new() -> (Self, Entries<R>) {
        let (sender, receiver) = mpsc::channel(1);

        (
            Self {
                sender,
                trailing: TrailingContent::default(),
            },
            Entries { receiver },
        )
    }

    pub fn trailing_content(mut self, trailing: TrailingContent) -> Self {
        self.trailing = trailing;
        self
    }

    /// Parse `source` to completion, sending one entry per key/value pair.
    /// Blocks on every send, so this must not be called from within an async task; see `spawn`.
    pub fn start<S: Read>(self, source: S) {
        let mut deserializer = serde_json::Deserializer::from_reader(source);
        let mut position = Position::Opening;

        let visitor = EntryVisitor {
            sender: &self.sender,
            position: &mut position,
            record: PhantomData,
        };

        let error = match (&mut deserializer).deserialize_map(visitor) {
            Ok(()) => match self.trailing {
                TrailingContent::Ignore => None,
                TrailingContent::Reject => deserializer
                    .end()
                    .err()
                    .map(|error| DecodeError::TrailingContent { error }),
            },
            Err(error) => position.into_decode_error(error),
        };

        if let Some(error) = error {
            if self.sender.blocking_send(Entry::Failed(error)).is_err() {
                debug!("entries dropped before the decode error could be delivered");
            }
        }
    }
}

impl<R> JsonStream<R>
where
    R: DeserializeOwned + Send + 'static,
{
    /// Run `start` on the blocking thread pool of the current Tokio runtime.
    pub fn spawn<S>(self, source: S) -> tokio::task::JoinHandle<()>
    where
        S: Read + Send + 'static,
    {
        tokio::task::spawn_blocking(move || self.start(source))
    }
}

/// Where in the document the decoder was when an error surfaced.
#[derive(Debug, Clone, Copy)]
enum Position {
    Opening,
    /// Between pairs, before the next key has started.
    Key(usize),
    /// Inside a key string.
    KeyBody(usize),
    Value(usize),
    Closing,
    /// The consumer went away; nothing left to report to.
    Detached,
}

impl Position {
    fn into_decode_error(self, error: serde_json::Error) -> Option<DecodeError> {
        match self {
            Position::Opening => Some(DecodeError::OpeningDelimiter { error }),
            Position::Key(_) if error.is_eof() => Some(DecodeError::ClosingDelimiter { error }),
            Position::Key(index) | Position::KeyBody(index) | Position::Value(index) => {
                Some(DecodeError::Element { index, error })
            }
            Position::Closing => Some(DecodeError::ClosingDelimiter { error }),
            Position::Detached => None,
        }
    }
}

struct EntryVisitor<'a, R> {
    sender: &'a mpsc::Sender<Entry<R>>,
    position: &'a mut Position,
    record: PhantomData<R>,
}

impl<'de, 'a, R> Visitor<'de> for EntryVisitor<'a, R>
where
    R: DeserializeOwned,
{
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON object of records keyed by id")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut index = 1;

        loop {
            *self.position = Position::Key(index);
            let seed = KeySeed {
                position: &mut *self.position,
                index,
            };
            let Some(key) = map.next_key_seed(seed)? else {
                break;
            };

            *self.position = Position::Value(index);
            let record = map.next_value::<R>()?;

            if self
                .sender
                .blocking_send(Entry::Record { key, record })
                .is_err()
            {
                *self.position = Position::Detached;
                debug!(index, "entries dropped, stopping decode");
                return Err(de::Error::custom("entries receiver dropped"));
            }

            index += 1;
        }

        *self.position = Position::Closing;
        Ok(())
    }
}

/// Marks the position as inside a key once the key token itself starts.
struct KeySeed<'a> {
    position: &'a mut Position,
    index: usize,
}

impl<'de, 'a> DeserializeSeed<'de> for KeySeed<'a> {
    type Value = String;

    fn deserialize<D>(self, deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        *self.position = Position::KeyBody(self.index);
        String::deserialize(deserializer)
    }
}
