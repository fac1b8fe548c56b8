use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use taxi_common::config::DispatchConfig;
use taxi_common::ids::new_message_id;
use taxi_dispatch::{Actor, DispatchEngine, DispatchError, Participant, Session};
use taxi_protocol::{parse_envelope, ClientEvent, ProtocolError, ServerEvent};

pub struct RelayServer {
    config: DispatchConfig,
    engine: DispatchEngine,
}

impl RelayServer {
    pub fn new(config: DispatchConfig, engine: DispatchEngine) -> Self {
        Self { config, engine }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "relay listening");
        serve(listener, self.engine.clone()).await
    }
}

pub async fn serve(listener: TcpListener, engine: DispatchEngine) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, engine, addr).await {
                warn!(%addr, error = %err, "connection error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    engine: DispatchEngine,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = Session::new(tx);
    info!(session = %session.id, %addr, "connection accepted");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match encode_event(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "dropping unencodable event");
                    continue;
                }
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(session = %session.id, error = %err, "read failed");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        handle_frame(&engine, &session, msg.to_text()?).await;
    }

    engine.disconnect(&session).await;
    writer.abort();
    info!(session = %session.id, %addr, "connection closed");
    Ok(())
}

fn encode_event(event: &ServerEvent) -> anyhow::Result<String> {
    let env = event.to_envelope(&new_message_id(), chrono::Utc::now().timestamp_millis())?;
    Ok(serde_json::to_string(&env)?)
}

fn send_error(session: &Session, code: &str, message: impl Into<String>) {
    let _ = session.tx.send(ServerEvent::error(code, message));
}

/// Decodes one text frame and runs it. Every failure is answered on the
/// originating session only.
async fn handle_frame(engine: &DispatchEngine, session: &Session, text: &str) {
    let envelope = match parse_envelope(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            send_error(session, "invalid_message", format!("invalid frame: {err}"));
            return;
        }
    };
    let event = match ClientEvent::decode(&envelope) {
        Ok(event) => event,
        Err(err @ ProtocolError::UnknownType(_)) => {
            debug!(session = %session.id, error = %err, "unknown event");
            send_error(session, "unknown_event", err.to_string());
            return;
        }
        Err(err) => {
            send_error(session, "validation_error", err.to_string());
            return;
        }
    };
    if let Err(err) = handle_event(engine, session, event).await {
        debug!(
            session = %session.id,
            message_type = %envelope.message_type,
            error = %err,
            "event rejected"
        );
        send_error(session, err.code(), err.to_string());
    }
}

async fn handle_event(
    engine: &DispatchEngine,
    session: &Session,
    event: ClientEvent,
) -> Result<(), DispatchError> {
    match event {
        ClientEvent::ConnectDriver(payload) => {
            engine.connect_driver(session, payload).await?;
        }
        ClientEvent::ConnectPassenger(payload) => {
            engine.connect_passenger(session, payload).await?;
        }
        event => {
            let participant = engine.identify(&session.id).await.ok_or_else(|| {
                DispatchError::NotAuthorized("connect as a driver or passenger first".to_string())
            })?;
            match participant {
                Participant::Driver(driver_id) => {
                    handle_driver_event(engine, &driver_id, event).await?
                }
                Participant::Passenger(passenger_id) => {
                    handle_passenger_event(engine, session, &passenger_id, event).await?
                }
            }
        }
    }
    Ok(())
}

async fn handle_driver_event(
    engine: &DispatchEngine,
    driver_id: &str,
    event: ClientEvent,
) -> Result<(), DispatchError> {
    match event {
        ClientEvent::LocationUpdate(update) => engine.update_location(driver_id, update).await?,
        ClientEvent::RideAccept(action) => {
            engine.accept(&action.ride_id, driver_id).await?;
        }
        ClientEvent::RideReject(action) => {
            engine.reject(&action.ride_id, driver_id).await;
        }
        ClientEvent::RideStart(action) => {
            engine.start(&action.ride_id, driver_id).await?;
        }
        ClientEvent::RideComplete(payload) => {
            engine
                .complete(&payload.ride_id, driver_id, payload.fare.as_deref())
                .await?;
        }
        ClientEvent::DriverOffline(_) => engine.driver_offline(driver_id).await?,
        ClientEvent::DriverAvailable(_) => {
            engine.set_driver_available(driver_id).await?;
        }
        ClientEvent::DriverMessage(chat) => {
            engine
                .chat(
                    &chat.ride_id,
                    Participant::Driver(driver_id.to_string()),
                    chat.message_text,
                )
                .await?;
        }
        other => return Err(wrong_role(&other, "passenger")),
    }
    Ok(())
}

async fn handle_passenger_event(
    engine: &DispatchEngine,
    session: &Session,
    passenger_id: &str,
    event: ClientEvent,
) -> Result<(), DispatchError> {
    match event {
        ClientEvent::RideRequest(request) => {
            engine.request_ride(passenger_id, request).await?;
        }
        ClientEvent::RideCancel(cancel) => {
            engine
                .cancel(
                    &cancel.ride_id,
                    Actor::Passenger(passenger_id.to_string()),
                    cancel.reason,
                )
                .await?;
        }
        ClientEvent::RideRating(rating) => {
            engine
                .rate(&rating.ride_id, passenger_id, rating.rating, rating.feedback)
                .await?;
        }
        ClientEvent::PassengerMessage(chat) => {
            engine
                .chat(
                    &chat.ride_id,
                    Participant::Passenger(passenger_id.to_string()),
                    chat.message_text,
                )
                .await?;
        }
        ClientEvent::GetNearbyDrivers(query) => {
            let nearby = engine
                .nearby_drivers(query.latitude, query.longitude, query.radius)
                .await?;
            let _ = session.tx.send(ServerEvent::NearbyDrivers(nearby));
        }
        ClientEvent::GetRideHistory(query) => {
            let history = engine.ride_history(passenger_id, query.limit).await;
            let _ = session.tx.send(ServerEvent::RideHistory(history));
        }
        other => return Err(wrong_role(&other, "driver")),
    }
    Ok(())
}

fn wrong_role(event: &ClientEvent, role: &str) -> DispatchError {
    let name = serde_json::to_value(event)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "event".to_string());
    DispatchError::NotAuthorized(format!("{name} is a {role} event"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use taxi_dispatch::EngineSettings;
    use taxi_geo::GeoEstimator;
    use taxi_store::mock::MemoryStore;

    use super::*;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (String, DispatchEngine) {
        let engine = DispatchEngine::new(
            EngineSettings::default(),
            GeoEstimator::straight_line(),
            Arc::new(MemoryStore::new()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, engine.clone()));
        (url, engine)
    }

    async fn send(socket: &mut Socket, message_type: &str, payload: Value) {
        let frame = json!({ "type": message_type, "id": "c1", "ts": 0, "payload": payload });
        socket.send(Message::Text(frame.to_string())).await.unwrap();
    }

    /// Next frame whose type is `expected`, skipping presence chatter.
    async fn expect(socket: &mut Socket, expected: &str) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("frame before timeout")
                .expect("socket open")
                .unwrap();
            let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            if frame["type"] == expected {
                return frame["payload"].clone();
            }
            assert_ne!(frame["type"], "error", "unexpected error frame {frame}");
        }
    }

    #[tokio::test]
    async fn ride_flows_over_the_socket() {
        let (url, engine) = start().await;
        let (mut driver, _) = connect_async(url.as_str()).await.unwrap();
        let (mut passenger, _) = connect_async(url.as_str()).await.unwrap();

        send(
            &mut driver,
            "connect_driver",
            json!({ "driver_id": "d1", "latitude": 0.0, "longitude": 0.01 }),
        )
        .await;
        expect(&mut driver, "driver_connected").await;
        send(&mut passenger, "connect_passenger", json!({ "passenger_id": "p1" })).await;
        expect(&mut passenger, "passenger_connected").await;

        send(
            &mut passenger,
            "ride_request",
            json!({
                "pickup_latitude": 0.0,
                "pickup_longitude": 0.0,
                "pickup_address": "A",
                "destination_latitude": 0.0,
                "destination_longitude": 0.1,
                "destination_address": "B",
            }),
        )
        .await;
        let offer = expect(&mut driver, "ride_request").await;
        let ride_id = offer["ride_id"].as_str().unwrap().to_string();

        send(&mut driver, "ride_accept", json!({ "ride_id": ride_id })).await;
        let accepted = expect(&mut passenger, "ride_accepted").await;
        assert_eq!(accepted["driver_id"], "d1");
        expect(&mut driver, "ride_accepted_confirmation").await;

        send(
            &mut passenger,
            "passenger_message",
            json!({ "ride_id": ride_id, "message_text": "on my way" }),
        )
        .await;
        let chat = expect(&mut driver, "passenger_message").await;
        assert_eq!(chat["message_text"], "on my way");

        driver.close(None).await.unwrap();
        let cancelled = expect(&mut passenger, "ride_cancelled").await;
        assert_eq!(cancelled["reason"], "driver disconnected");
        assert!(engine.driver("d1").await.is_none());
    }

    #[tokio::test]
    async fn bad_frames_are_answered_with_errors() {
        let (url, _engine) = start().await;
        let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

        socket.send(Message::Text("not json".to_string())).await.unwrap();
        let frame = next_error(&mut socket).await;
        assert_eq!(frame["code"], "invalid_message");

        send(&mut socket, "teleport", json!({})).await;
        assert_eq!(next_error(&mut socket).await["code"], "unknown_event");

        send(&mut socket, "ride_rating", json!({ "ride_id": "r1", "rating": "five" })).await;
        assert_eq!(next_error(&mut socket).await["code"], "validation_error");

        send(&mut socket, "ride_accept", json!({ "ride_id": "r1" })).await;
        assert_eq!(next_error(&mut socket).await["code"], "not_authorized");

        send(&mut socket, "connect_passenger", json!({ "passenger_id": "p1" })).await;
        expect(&mut socket, "passenger_connected").await;
        send(&mut socket, "ride_accept", json!({ "ride_id": "r1" })).await;
        let frame = next_error(&mut socket).await;
        assert_eq!(frame["code"], "not_authorized");
        assert_eq!(frame["message"], "not authorized: ride_accept is a driver event");
    }

    async fn next_error(socket: &mut Socket) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame before timeout")
            .expect("socket open")
            .unwrap();
        let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame["type"], "error");
        frame["payload"].clone()
    }
}
