// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! rumqttc-backed [`Transport`] used by both MQTT session variants.

use std::time::Duration;

use async_trait::async_trait;
use iotkit_core::{decode_payload, guard, HandlerSlot, MessageHandler, Transport, TransportError};
use log::{debug, info, trace, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 100;

/// How long a graceful close keeps polling to flush DISCONNECT.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// A PUBLISH handed from a caller to the session task.
#[derive(Debug)]
pub struct MqttOutbound {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

/// One broker connection: the rumqttc client handle plus its event loop.
///
/// The event loop is polled only from the supervisor task. A subscription,
/// when configured, is re-issued after every CONNACK.
pub struct MqttTransport {
    name: String,
    client: AsyncClient,
    eventloop: EventLoop,
    subscription: Option<(String, QoS)>,
    handler: HandlerSlot<dyn MessageHandler>,
}

impl MqttTransport {
    pub fn publisher(name: impl Into<String>, options: MqttOptions) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            name: name.into(),
            client,
            eventloop,
            subscription: None,
            handler: HandlerSlot::empty(),
        }
    }

    pub fn subscriber(
        name: impl Into<String>,
        options: MqttOptions,
        topic: impl Into<String>,
        qos: QoS,
        handler: HandlerSlot<dyn MessageHandler>,
    ) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            name: name.into(),
            client,
            eventloop,
            subscription: Some((topic.into(), qos)),
            handler,
        }
    }
}

/// Handle one polled event-loop item on a live connection.
fn on_event(
    name: &str,
    handler: &HandlerSlot<dyn MessageHandler>,
    event: Result<Event, ConnectionError>,
) -> Result<(), TransportError> {
    match event {
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            deliver(name, handler, &publish.topic, &publish.payload);
            Ok(())
        }
        Ok(Event::Incoming(Packet::Disconnect)) => Err(TransportError::Closed),
        Ok(event) => {
            trace!("[{name}] {event:?}");
            Ok(())
        }
        Err(e) => Err(TransportError::protocol(e)),
    }
}

fn deliver(name: &str, handler: &HandlerSlot<dyn MessageHandler>, topic: &str, payload: &[u8]) {
    let data = match decode_payload(payload) {
        Ok(data) => data,
        Err(e) => {
            warn!("[{name}] Dropping non-JSON payload on topic '{topic}': {e}");
            return;
        }
    };

    debug!("[{name}] Received message on '{topic}'");
    if let Some(handler) = handler.get() {
        let _ = guard(name, "on_message", || handler.on_message(topic, &data));
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Outbound = MqttOutbound;

    async fn connect(&mut self) -> Result<(), TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Rejected(format!("{:?}", ack.code)));
                    }
                    if let Some((topic, qos)) = &self.subscription {
                        self.client
                            .try_subscribe(topic.as_str(), *qos)
                            .map_err(TransportError::protocol)?;
                        info!("[{}] Subscribed to '{topic}'", self.name);
                    }
                    return Ok(());
                }
                Ok(event) => trace!("[{}] {event:?}", self.name),
                Err(e) => return Err(TransportError::protocol(e)),
            }
        }
    }

    async fn next_event(&mut self) -> Result<(), TransportError> {
        let event = self.eventloop.poll().await;
        on_event(&self.name, &self.handler, event)
    }

    /// Queue a PUBLISH on the rumqttc request channel.
    ///
    /// The channel only drains while the event loop is polled, so a full
    /// channel is waited out by polling here rather than treated as a failure.
    async fn write(&mut self, item: MqttOutbound) -> Result<(), TransportError> {
        debug!("[{}] Publishing {} bytes to '{}'", self.name, item.payload.len(), item.topic);
        let publish = self.client.publish(item.topic, item.qos, false, item.payload);
        tokio::pin!(publish);
        loop {
            tokio::select! {
                biased;
                queued = &mut publish => return queued.map_err(TransportError::protocol),
                event = self.eventloop.poll() => on_event(&self.name, &self.handler, event)?,
            }
        }
    }

    async fn close(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(CLOSE_GRACE, flush).await;
    }
}
