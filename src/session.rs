//! Owns the broker connection, the operational AMQP channel, and the
//! dispatcher's drain loop (spec.md §4.2).
//!
//! Grounded on `rustlib/rabbitmq/src/subscriber.rs`'s `Subscriber::new`
//! (connection + channel setup with a timeout) and on the original's
//! `AMQP.on_channel_open`/`on_channel_close` (core.py lines 45-58), which
//! installs a close callback that unconditionally reopens the channel.

use crate::config::Config;
use crate::consts::DEAD_LETTERS;
use crate::dead_letter::DeadLetterConsumer;
use crate::dispatcher::{run_dispatch_loop, Dispatcher, WorkItem};
use crate::error::ChannelLayerError;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// How often the reopen supervisor polls the operational channel's status.
/// There is no `on_error` push notification wired up here; lapin surfaces
/// channel closure via `ChannelStatus`, so a short poll is the simplest
/// faithful translation of the original's close callback.
const REOPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the connection and serves as the caller-facing entry point for
/// enqueueing work. `BrokerSession::connect` is the crate's equivalent of
/// the original's `ConnectionThread.__init__` + `.start()` (core.py lines
/// 357-368): it spins up the background task that drives the broker and
/// returns immediately with a handle callers can submit work through.
pub struct BrokerSession {
    dispatcher: Dispatcher,
    connection: Arc<Connection>,
}

impl BrokerSession {
    pub async fn connect(config: &Config) -> Result<Self, ChannelLayerError> {
        let connection = timeout(
            Duration::from_secs(60),
            Connection::connect(&config.amqp_url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| ChannelLayerError::ConnectionFailed("connection timed out".to_string()))?
        .map_err(|e| ChannelLayerError::ConnectionFailed(e.to_string()))?;
        let connection = Arc::new(connection);

        let (dispatcher, rx) = Dispatcher::new(config.submission_queue_capacity);
        let resubmit = dispatcher.raw_sender();

        let channel = open_operational_channel(&connection, &dispatcher).await?;
        let channel_slot = Arc::new(Mutex::new(channel));

        spawn_reopen_supervisor(connection.clone(), channel_slot.clone(), dispatcher.clone());

        tokio::spawn(run_dispatch_loop(
            rx,
            resubmit,
            channel_slot,
            config.dispatch_tick_interval,
        ));

        Ok(Self {
            dispatcher,
            connection,
        })
    }

    pub async fn submit(&self, item: WorkItem) -> Result<(), ChannelLayerError> {
        self.dispatcher.submit(item).await
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// A clone of the connection handle, used by the facade to open
    /// throwaway probe channels (see `ChannelLayer::channel_exists`) that
    /// must not share fate with the operational channel.
    pub fn connection_handle(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    /// Shuts down the session. The dispatcher loop exits once the
    /// submission queue's senders are all dropped; closing the connection
    /// here tears down the operational channel and the dead-letter
    /// consumer with it.
    pub async fn stop(self) {
        let _ = self
            .connection
            .close(200, "channel-core session stopped")
            .await;
    }
}

async fn open_operational_channel(
    connection: &Connection,
    dispatcher: &Dispatcher,
) -> Result<Channel, ChannelLayerError> {
    let channel = connection.create_channel().await?;
    declare_dead_letters(&channel).await?;
    let consumer = DeadLetterConsumer::new(channel.clone(), dispatcher.clone());
    tokio::spawn(consumer.run());
    Ok(channel)
}

/// Declares the dead-letter exchange and queue and binds them (spec.md §3,
/// "Dead-letter queue"). Re-run on every reopen, matching the original's
/// `declare_dead_letters` being called fresh from `on_channel_open` each
/// time a channel is (re)established.
async fn declare_dead_letters(channel: &Channel) -> Result<(), ChannelLayerError> {
    channel
        .exchange_declare(
            DEAD_LETTERS,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            DEAD_LETTERS,
            QueueDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            DEAD_LETTERS,
            DEAD_LETTERS,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Watches the operational channel for closure and reopens it, re-declaring
/// the dead-letter topology and restarting its consumer each time — the
/// direct translation of `on_channel_close` (core.py lines 55-58), which
/// the source itself flags with `# FIXME: Check if error is recoverable`
/// and simply reopens unconditionally regardless of cause.
fn spawn_reopen_supervisor(
    connection: Arc<Connection>,
    channel_slot: Arc<Mutex<Channel>>,
    dispatcher: Dispatcher,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REOPEN_POLL_INTERVAL).await;

            let closed = {
                let channel = channel_slot.lock().await;
                !channel.status().is_connected()
            };
            if !closed {
                continue;
            }

            log::warn!("channel_core: operational channel closed, reopening");
            match open_operational_channel(&connection, &dispatcher).await {
                Ok(fresh) => *channel_slot.lock().await = fresh,
                Err(e) => log::error!("channel_core: failed to reopen operational channel: {}", e),
            }
        }
    });
}
