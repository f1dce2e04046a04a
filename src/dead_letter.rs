//! The dead-letter consumer (spec.md §4.5): a permanent consumer on the
//! dead-letter queue that reacts to expire markers (group-member discard)
//! and expired/length-dropped channel messages (member-exchange cleanup).
//!
//! Grounded on the original's `on_dead_letter` (core.py lines 312-331) and
//! on the bounded-concurrency delivery loop in
//! `rustlib/rabbitmq/src/subscriber.rs`'s `process_messages`.

use crate::codec;
use crate::consts::{DEAD_LETTERS, EXPIRE_MARKER_PREFIX, X_DEATH_HEADER};
use crate::dispatcher::{Dispatcher, ReplySink, WorkItem};
use crate::message::Message;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};

pub struct DeadLetterConsumer {
    channel: Channel,
    dispatcher: Dispatcher,
}

impl DeadLetterConsumer {
    pub fn new(channel: Channel, dispatcher: Dispatcher) -> Self {
        Self { channel, dispatcher }
    }

    pub async fn run(self) {
        let consumer = match self
            .channel
            .basic_consume(
                DEAD_LETTERS,
                "channel-core.dead-letters",
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                log::error!("channel_core: failed to consume dead letters: {}", e);
                return;
            }
        };

        let mut stream = consumer.into_stream();
        while let Some(delivery_res) = stream.next().await {
            let delivery = match delivery_res {
                Ok(d) => d,
                Err(e) => {
                    log::error!("channel_core: dead-letter delivery error: {}", e);
                    continue;
                }
            };

            if let Err(e) = self
                .channel
                .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                .await
            {
                log::error!("channel_core: failed to ack dead letter: {}", e);
            }

            let Some((origin_queue, reason)) = first_death(&delivery.properties) else {
                log::warn!("channel_core: dead letter missing x-death header, ignoring");
                continue;
            };

            if is_expire_marker(&origin_queue) {
                // The marker queue's own `x-max-length=1` cap dead-letters
                // the *previous* marker whenever `group_add` re-publishes
                // one; that is not a real expiry and must not trigger a
                // discard (SPEC_FULL.md §9, "Self-loops on dead-letter
                // processing").
                if reason == "maxlen" {
                    log::debug!(
                        "channel_core: ignoring maxlen dead letter from marker queue {}",
                        origin_queue
                    );
                    continue;
                }
                self.handle_expired_marker(&delivery.data).await;
            } else {
                self.handle_expired_channel_message(origin_queue).await;
            }
        }
    }

    async fn handle_expired_marker(&self, body: &[u8]) {
        let message = match codec::decode(body) {
            Ok(m) => m,
            Err(e) => {
                log::error!("channel_core: failed to decode expire marker: {}", e);
                return;
            }
        };

        let (Some(group), Some(channel)) = (str_field(&message, "group"), str_field(&message, "channel"))
        else {
            log::warn!("channel_core: malformed expire marker payload: {:?}", message);
            return;
        };

        log::info!(
            "channel_core: group membership expired, discarding group={} channel={}",
            group,
            channel
        );

        let item = WorkItem::new(ReplySink::Discard, move |amqp_channel: Channel| async move {
            amqp_channel
                .exchange_unbind(
                    &channel,
                    &group,
                    "",
                    ExchangeUnbindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            Ok(())
        });

        if let Err(e) = self.dispatcher.submit(item).await {
            log::error!(
                "channel_core: failed to submit group_discard from dead-letter consumer: {}",
                e
            );
        }
    }

    async fn handle_expired_channel_message(&self, channel_name: String) {
        log::info!(
            "channel_core: reaping orphaned member exchange for channel={}",
            channel_name
        );

        let item = WorkItem::new(ReplySink::Discard, move |amqp_channel: Channel| async move {
            amqp_channel
                .exchange_delete(&channel_name, ExchangeDeleteOptions::default())
                .await?;
            Ok(())
        });

        if let Err(e) = self.dispatcher.submit(item).await {
            log::error!(
                "channel_core: failed to submit exchange_delete from dead-letter consumer: {}",
                e
            );
        }
    }
}

fn is_expire_marker(queue: &str) -> bool {
    queue.starts_with(EXPIRE_MARKER_PREFIX)
}

/// Recovers the origin queue name and dead-letter reason from the first
/// entry of the `x-death` header array, matching the original's
/// `properties.headers['x-death'][0]['queue']` (core.py line 317).
fn first_death(properties: &BasicProperties) -> Option<(String, String)> {
    let headers = properties.headers().as_ref()?;
    let death = headers.inner().get(X_DEATH_HEADER)?;
    let AMQPValue::FieldArray(entries) = death else {
        return None;
    };
    let first = entries.as_slice().first()?;
    let AMQPValue::FieldTable(table) = first else {
        return None;
    };

    let queue = match table.inner().get("queue")? {
        AMQPValue::LongString(s) => s.to_string(),
        _ => return None,
    };
    let reason = match table.inner().get("reason") {
        Some(AMQPValue::LongString(s)) => s.to_string(),
        _ => String::new(),
    };
    Some((queue, reason))
}

fn str_field(message: &Message, key: &str) -> Option<String> {
    match message.get(key)? {
        rmpv::Value::String(s) => s.as_str().map(|s| s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldTable;

    #[test]
    fn expire_marker_queues_are_recognized_by_prefix() {
        assert!(is_expire_marker("expire.bind.g.c"));
        assert!(!is_expire_marker("g"));
        assert!(!is_expire_marker("dead-letters"));
    }

    fn death_properties(queue: &str, reason: &str) -> BasicProperties {
        let mut death_entry = FieldTable::default();
        death_entry.insert("queue".into(), AMQPValue::LongString(queue.into()));
        death_entry.insert("reason".into(), AMQPValue::LongString(reason.into()));

        let mut headers = FieldTable::default();
        headers.insert(
            X_DEATH_HEADER.into(),
            AMQPValue::FieldArray(vec![AMQPValue::FieldTable(death_entry)].into()),
        );

        BasicProperties::default().with_headers(headers)
    }

    #[test]
    fn first_death_recovers_origin_queue_and_reason() {
        let properties = death_properties("expire.bind.g.c", "expired");
        let (queue, reason) = first_death(&properties).expect("x-death present");
        assert_eq!(queue, "expire.bind.g.c");
        assert_eq!(reason, "expired");
    }

    #[test]
    fn first_death_is_none_without_the_header() {
        let properties = BasicProperties::default();
        assert!(first_death(&properties).is_none());
    }

    #[test]
    fn str_field_rejects_non_string_values() {
        let mut message = Message::new();
        message.insert("n".to_string(), crate::message::integer(1));
        assert_eq!(str_field(&message, "n"), None);
        assert_eq!(str_field(&message, "missing"), None);
    }
}
