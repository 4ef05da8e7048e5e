//! In-memory transport driven by a script of open outcomes

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::transport::{ByteStream, Transport, TransportError};

/// Outcome of one `open()` call
pub enum Script {
    /// Refuse the open
    Fail(TransportError),
    /// Accept, yield the chunks, then stay open
    Stream(Vec<Vec<u8>>),
    /// Accept, yield the chunks, then end the body
    StreamThenClose(Vec<Vec<u8>>),
    /// Never resolve; counts as live until the open is dropped
    Hang,
}

pub struct ScriptedTransport {
    script: Mutex<VecDeque<Script>>,
    fail_when_exhausted: bool,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fail_when_exhausted: true,
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Every open is refused
    pub fn always_failing() -> Arc<Self> {
        Self::new(vec![])
    }

    /// Every open is accepted and stays open
    pub fn always_open() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fail_when_exhausted: false,
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of `open()` calls so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams handed out, or opens still pending, not yet dropped
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn tracked(&self, chunks: Vec<Vec<u8>>, close: bool) -> ByteStream {
        let guard = LiveGuard::new(Arc::clone(&self.live));
        let body = stream::iter(chunks.into_iter().map(Ok));
        let tail: ByteStream = if close {
            stream::empty().boxed()
        } else {
            stream::pending().boxed()
        };
        body.chain(tail)
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<ByteStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Stream(chunks)) => Ok(self.tracked(chunks, false)),
            Some(Script::StreamThenClose(chunks)) => Ok(self.tracked(chunks, true)),
            Some(Script::Hang) => {
                let _pending = LiveGuard::new(Arc::clone(&self.live));
                std::future::pending().await
            }
            None if self.fail_when_exhausted => {
                Err(TransportError::Connect("connection refused".to_string()))
            }
            None => Ok(self.tracked(vec![], false)),
        }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
