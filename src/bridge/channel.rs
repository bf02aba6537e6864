//! Channel Manager: sole owner of the broker connection and its channel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{BridgeError, BridgeResult, BrokerError};
use crate::observer::{BridgeEvent, Observer};
use crate::transport::{BrokerChannel, Connector, FailureHook};

/// Callback fired when the connection drops outside of any call.
pub type ConnectionLostHook = Arc<dyn Fn(&BridgeError) + Send + Sync>;

/// Owns the single channel shared by pools, publisher and inspector.
pub struct ChannelManager {
    uri: String,
    confirms: bool,
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<Arc<dyn BrokerChannel>>>,
    lost: Arc<AtomicBool>,
    listeners: Arc<StdMutex<Vec<ConnectionLostHook>>>,
    observer: Arc<dyn Observer>,
}

impl ChannelManager {
    pub fn new(
        uri: &str,
        confirms: bool,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            uri: uri.to_string(),
            confirms,
            connector,
            slot: Mutex::new(None),
            lost: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(StdMutex::new(Vec::new())),
            observer,
        }
    }

    /// Register a hook for connection loss. Reconnecting is up to the hook's
    /// owner, typically by calling `prepare` again.
    pub fn on_connection_lost(&self, hook: ConnectionLostHook) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Return the open channel, connecting first if there is none or the
    /// previous one has failed.
    #[instrument(skip(self))]
    pub async fn open(&self) -> BridgeResult<Arc<dyn BrokerChannel>> {
        let mut slot = self.slot.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() && !self.lost.load(Ordering::SeqCst) {
                debug!("Reusing open channel");
                return Ok(Arc::clone(channel));
            }
            if let Some(stale) = slot.take() {
                if let Err(e) = stale.close().await {
                    debug!(error = %e, "Closing stale channel failed");
                }
            }
        }

        self.lost.store(false, Ordering::SeqCst);
        let channel = self
            .connector
            .connect(&self.uri, self.failure_hook())
            .await
            .map_err(|e| BridgeError::Connection(e.message))?;
        if self.confirms {
            channel
                .enable_confirms()
                .await
                .map_err(|e| BridgeError::Connection(e.message))?;
        }

        info!(confirms = self.confirms, "Broker channel opened");
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// The current channel. Fails when not prepared or when the connection
    /// has been lost since.
    pub async fn channel(&self) -> BridgeResult<Arc<dyn BrokerChannel>> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            None => Err(BridgeError::NotPrepared),
            Some(_) if self.lost.load(Ordering::SeqCst) => {
                Err(BridgeError::Connection("connection lost, prepare again".into()))
            }
            Some(channel) if !channel.is_open() => {
                Err(BridgeError::Connection("channel is closed".into()))
            }
            Some(channel) => Ok(Arc::clone(channel)),
        }
    }

    /// Run `op` against the current channel.
    pub async fn with_channel<F, Fut, T>(&self, op: F) -> BridgeResult<T>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let channel = self.channel().await?;
        op(channel).await
    }

    /// Whether a channel is held, open or not.
    pub async fn is_prepared(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Close the channel and then the connection. A no-op when nothing is open.
    pub async fn close(&self) {
        let channel = self.slot.lock().await.take();
        if let Some(channel) = channel {
            match channel.close().await {
                Ok(()) => info!("Broker channel closed"),
                Err(e) => warn!(error = %e, "Closing broker channel failed"),
            }
        }
    }

    fn failure_hook(&self) -> FailureHook {
        let lost = Arc::clone(&self.lost);
        let listeners = Arc::clone(&self.listeners);
        let observer = Arc::clone(&self.observer);
        Arc::new(move |err: BrokerError| {
            lost.store(true, Ordering::SeqCst);
            observer.observe(BridgeEvent::ConnectionLost {
                reason: err.message.clone(),
            });
            let error = BridgeError::Connection(err.message);
            let hooks = listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for hook in hooks {
                hook(&error);
            }
        })
    }
}

/// Map a broker failure, reporting a closed channel as a connection error.
pub(crate) fn classify(
    channel: &dyn BrokerChannel,
    err: BrokerError,
    otherwise: fn(String) -> BridgeError,
) -> BridgeError {
    if channel.is_open() {
        otherwise(err.message)
    } else {
        BridgeError::Connection(err.message)
    }
}
