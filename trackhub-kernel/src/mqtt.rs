/**
 * CONNEXION BROKER MQTT - Listener OwnTracks
 *
 * RÔLE :
 * Établit une connexion authentifiée (TLS optionnel) au broker, s'abonne à
 * `owntracks/#` en QoS 1 et livre les messages bruts via une file bornée.
 *
 * FONCTIONNEMENT :
 * - connect : options rumqttc, CONNACK puis SUBACK attendus chacun sous timeout
 * - une task de forwarding possède l'event loop (keep-alive, acks QoS 1)
 *   et pousse chaque PUBLISH dans la file
 * - file pleine : attente bornée (`forward_timeout_ms`) puis le message est jeté,
 *   l'event loop ne reste jamais bloquée
 * - perte de connexion : la task s'arrête, la file se ferme, pas de reconnexion
 * - disconnect : arrêt de la task, UNSUBSCRIBE sous timeout, puis fermeture quoi qu'il arrive ;
 *   si le transport est déjà perdu, plus aucun poll (rumqttc reconnecterait)
 *
 * QoS 1 = at-least-once : l'appelant doit tolérer les doublons.
 */

use crate::config::{ConnectionConfig, DEFAULT_CLIENT_ID};
use crate::models::RawMessage;
use rumqttc::tokio_rustls::rustls::RootCertStore;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Tous les utilisateurs, tous les devices
pub const OWNTRACKS_TOPIC: &str = "owntracks/#";

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Erreurs fatales au démarrage du pipeline, jamais retentées.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("listener already connected")]
    AlreadyConnected,
    #[error("CA certificate error: {0}")]
    Certificate(String),
    #[error("timeout during {0}")]
    HandshakeTimeout(&'static str),
    #[error("broker rejected {stage}: {reason}")]
    BrokerRejected { stage: &'static str, reason: String },
    /// Source fermée pendant que le pipeline tournait
    #[error("broker connection lost")]
    ConnectionLost,
    #[error("MQTT transport error: {0}")]
    Transport(#[from] rumqttc::ConnectionError),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Erreurs de fermeture: loggées par l'appelant, jamais bloquantes.
#[derive(Debug, thiserror::Error)]
pub enum DisconnectError {
    #[error("listener not connected")]
    NotConnected,
    #[error("timeout during unsubscribe")]
    Timeout,
    #[error("forwarding task failed: {0}")]
    Forwarder(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT transport error: {0}")]
    Transport(#[from] rumqttc::ConnectionError),
}

/// Source de messages bruts pilotée par la boucle de dispatch.
///
/// `disconnect` n'est pas idempotent: l'appelant garantit un seul appel par
/// connexion réussie, jamais en concurrence avec `connect`.
pub trait Broker: Send {
    fn connect(
        &mut self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<mpsc::Receiver<RawMessage>, ConnectionError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), DisconnectError>> + Send;
}

struct Session {
    client: AsyncClient,
    stop: oneshot::Sender<()>,
    forwarder: JoinHandle<(EventLoop, ForwardEnd)>,
    timeout: Duration,
}

/// Pourquoi la task de forwarding s'est arrêtée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardEnd {
    Stopped,
    ConsumerGone,
    ConnectionLost,
}

/// Client MQTT qui écoute les messages OwnTracks.
#[derive(Default)]
pub struct Listener {
    session: Option<Session>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Faux dès que la connexion est perdue, même sans `disconnect`
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.forwarder.is_finished())
    }
}

impl Broker for Listener {
    async fn connect(
        &mut self,
        config: &ConnectionConfig,
    ) -> Result<mpsc::Receiver<RawMessage>, ConnectionError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let opts = mqtt_options(config)?;
        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let limit = config.timeout();

        info!(broker = %config.broker_address(), client_id = %config.client_id, "connecting to MQTT broker");
        timeout(limit, wait_for_connack(&mut eventloop, &tx))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout("connect"))??;

        client.subscribe(OWNTRACKS_TOPIC, QoS::AtLeastOnce).await?;
        timeout(limit, wait_for_suback(&mut eventloop, &tx))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout("subscribe"))??;
        info!(topic = OWNTRACKS_TOPIC, "subscribed");

        let (stop, stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_messages(eventloop, tx, stop_rx, config.forward_timeout()));
        self.session = Some(Session {
            client,
            stop,
            forwarder,
            timeout: limit,
        });
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), DisconnectError> {
        let session = self.session.take().ok_or(DisconnectError::NotConnected)?;

        // la task rend l'event loop et ferme la file en se terminant
        let _ = session.stop.send(());
        let (mut eventloop, end) = session
            .forwarder
            .await
            .map_err(|e| DisconnectError::Forwarder(e.to_string()))?;

        if end == ForwardEnd::ConnectionLost {
            // un nouveau poll relancerait la connexion
            info!("transport already gone, nothing to unsubscribe");
            return Ok(());
        }

        let unsubscribed = match timeout(session.timeout, unsubscribe(&session.client, &mut eventloop)).await {
            Ok(result) => result,
            Err(_) => Err(DisconnectError::Timeout),
        };
        if let Err(e) = &unsubscribed {
            warn!(error = %e, "unsubscribe failed, closing connection anyway");
        }

        close(&session.client, &mut eventloop).await;
        info!("disconnected from MQTT broker");
        unsubscribed
    }
}

fn mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, ConnectionError> {
    // rumqttc refuse un client id vide
    let client_id = match config.client_id.trim() {
        "" => DEFAULT_CLIENT_ID,
        id => id,
    };
    let mut opts = MqttOptions::new(client_id, &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    opts.set_clean_session(true);
    if let Some(user) = &config.username {
        opts.set_credentials(user, config.password.clone().unwrap_or_default());
    }
    if config.tls {
        let ca = load_ca(config.ca_file.as_deref())?;
        opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }
    Ok(opts)
}

/// Lit la CA et vérifie qu'elle contient au moins un certificat PEM
pub fn load_ca(path: Option<&Path>) -> Result<Vec<u8>, ConnectionError> {
    let path = path.ok_or_else(|| ConnectionError::Certificate("TLS enabled but no ca_file configured".into()))?;
    let pem = std::fs::read(path)
        .map_err(|e| ConnectionError::Certificate(format!("cannot read {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectionError::Certificate(format!("invalid PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ConnectionError::Certificate(format!(
            "no certificate found in {}",
            path.display()
        )));
    }

    // même contrôle que rumqttc à la connexion, mais avant toute I/O réseau
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| ConnectionError::Certificate(format!("unusable certificate in {}: {e}", path.display())))?;
    }
    Ok(pem)
}

async fn wait_for_connack(
    eventloop: &mut EventLoop,
    tx: &mpsc::Sender<RawMessage>,
) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
            Ok(Event::Incoming(Incoming::Publish(p))) => stash(tx, RawMessage::new(p.topic, p.payload.to_vec())),
            Ok(_) => {}
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectionError::BrokerRejected {
                    stage: "connect",
                    reason: format!("{code:?}"),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn wait_for_suback(
    eventloop: &mut EventLoop,
    tx: &mpsc::Sender<RawMessage>,
) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Incoming::SubAck(ack)) => {
                if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                    return Err(ConnectionError::BrokerRejected {
                        stage: "subscribe",
                        reason: format!("{:?}", ack.return_codes),
                    });
                }
                return Ok(());
            }
            Event::Incoming(Incoming::Publish(p)) => stash(tx, RawMessage::new(p.topic, p.payload.to_vec())),
            _ => {}
        }
    }
}

/// Message reçu pendant le handshake: la file est encore vide, pas d'attente
fn stash(tx: &mpsc::Sender<RawMessage>, msg: RawMessage) {
    if let Err(TrySendError::Full(msg)) = tx.try_send(msg) {
        warn!(topic = %msg.topic, "handoff queue full during handshake, message dropped");
    }
}

async fn forward_messages(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<RawMessage>,
    mut stop: oneshot::Receiver<()>,
    wait: Duration,
) -> (EventLoop, ForwardEnd) {
    let end = loop {
        tokio::select! {
            _ = &mut stop => break ForwardEnd::Stopped,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let msg = RawMessage::new(p.topic, p.payload.to_vec());
                    match tx.send_timeout(msg, wait).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(msg)) => {
                            warn!(topic = %msg.topic, "handoff queue full, message dropped");
                        }
                        Err(SendTimeoutError::Closed(_)) => {
                            debug!("message consumer gone, stopping forwarder");
                            break ForwardEnd::ConsumerGone;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection lost");
                    break ForwardEnd::ConnectionLost;
                }
            }
        }
    };
    (eventloop, end)
}

async fn unsubscribe(client: &AsyncClient, eventloop: &mut EventLoop) -> Result<(), DisconnectError> {
    client.unsubscribe(OWNTRACKS_TOPIC).await?;
    loop {
        if let Event::Incoming(Incoming::UnsubAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn close(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.disconnect().await.is_err() {
        return;
    }
    let _ = timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    // Pair MQTT 3.1.1 minimal, scripté test par test

    async fn read_packet(sock: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = sock.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = sock.read_u8().await.ok()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        sock.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut frame = vec![0x30];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            frame.push(byte);
            if len == 0 {
                break;
            }
        }
        frame.extend(body);
        frame
    }

    /// CONNECT -> CONNACK(code), renvoie le socket
    async fn accept_with_connack(server: &TcpListener, code: u8) -> TcpStream {
        let (mut sock, _) = server.accept().await.unwrap();
        let (header, _) = read_packet(&mut sock).await.unwrap();
        assert_eq!(header >> 4, 1, "expected CONNECT");
        sock.write_all(&[0x20, 0x02, 0x00, code]).await.unwrap();
        sock
    }

    /// SUBSCRIBE -> SUBACK(granted)
    async fn answer_subscribe(sock: &mut TcpStream, granted: u8) {
        let (header, body) = read_packet(sock).await.unwrap();
        assert_eq!(header, 0x82, "expected SUBSCRIBE");
        let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        assert_eq!(&body[4..4 + topic_len], OWNTRACKS_TOPIC.as_bytes());
        assert_eq!(body[4 + topic_len], 1, "expected QoS 1");
        sock.write_all(&[0x90, 0x03, body[0], body[1], granted]).await.unwrap();
    }

    async fn fake_broker() -> (TcpListener, ConnectionConfig) {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig {
            host: "127.0.0.1".into(),
            port: server.local_addr().unwrap().port(),
            timeout_ms: 2_000,
            ..Default::default()
        };
        (server, config)
    }

    #[tokio::test]
    async fn test_connect_receive_disconnect() {
        let (server, config) = fake_broker().await;
        let broker = tokio::spawn(async move {
            let mut sock = accept_with_connack(&server, 0).await;
            answer_subscribe(&mut sock, 0x01).await;
            sock.write_all(&publish_frame("owntracks/alice/phone1", br#"{"_type":"ping"}"#))
                .await
                .unwrap();

            let (header, body) = read_packet(&mut sock).await.unwrap();
            assert_eq!(header, 0xA2, "expected UNSUBSCRIBE");
            sock.write_all(&[0xB0, 0x02, body[0], body[1]]).await.unwrap();
            if let Some((header, _)) = read_packet(&mut sock).await {
                assert_eq!(header, 0xE0, "expected DISCONNECT");
            }
        });

        let mut listener = Listener::new();
        let mut rx = listener.connect(&config).await.unwrap();
        assert!(listener.is_connected());

        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg, RawMessage::new("owntracks/alice/phone1", &br#"{"_type":"ping"}"#[..]));

        assert!(matches!(
            listener.connect(&config).await,
            Err(ConnectionError::AlreadyConnected)
        ));

        listener.disconnect().await.unwrap();
        assert!(!listener.is_connected());
        assert!(rx.recv().await.is_none(), "message source must close");
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (server, mut config) = fake_broker().await;
        config.timeout_ms = 200;
        let silent = tokio::spawn(async move {
            let (sock, _) = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let result = Listener::new().connect(&config).await;
        assert!(matches!(result, Err(ConnectionError::HandshakeTimeout("connect"))));
        silent.abort();
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (server, config) = fake_broker().await;
        let broker = tokio::spawn(async move {
            // 0x05: not authorized
            let _sock = accept_with_connack(&server, 0x05).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let result = Listener::new().connect(&config).await;
        assert!(matches!(
            result,
            Err(ConnectionError::BrokerRejected { stage: "connect", .. })
        ));
        broker.abort();
    }

    #[tokio::test]
    async fn test_subscribe_rejected() {
        let (server, config) = fake_broker().await;
        let broker = tokio::spawn(async move {
            let mut sock = accept_with_connack(&server, 0).await;
            answer_subscribe(&mut sock, 0x80).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut listener = Listener::new();
        let result = listener.connect(&config).await;
        assert!(matches!(
            result,
            Err(ConnectionError::BrokerRejected { stage: "subscribe", .. })
        ));
        assert!(!listener.is_connected());
        broker.abort();
    }

    #[tokio::test]
    async fn test_connection_lost_closes_source() {
        let (server, config) = fake_broker().await;
        tokio::spawn(async move {
            let mut sock = accept_with_connack(&server, 0).await;
            answer_subscribe(&mut sock, 0x01).await;
            drop(sock);
        });

        let mut listener = Listener::new();
        let mut rx = listener.connect(&config).await.unwrap();
        let next = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(next.is_none());

        for _ in 0..50 {
            if !listener.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!listener.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_after_loss_never_redials() {
        let (server, mut config) = fake_broker().await;
        config.timeout_ms = 1_000;
        let broker = tokio::spawn(async move {
            let mut sock = accept_with_connack(&server, 0).await;
            answer_subscribe(&mut sock, 0x01).await;
            drop(sock);
            // une seconde connexion serait une reconnexion
            timeout(Duration::from_millis(500), server.accept()).await.is_ok()
        });

        let mut listener = Listener::new();
        let mut rx = listener.connect(&config).await.unwrap();
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());

        let result = timeout(Duration::from_millis(300), listener.disconnect()).await;
        assert!(matches!(result, Ok(Ok(()))), "disconnect should return at once: {result:?}");
        assert!(!broker.await.unwrap(), "broker was dialed again");
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (server, mut config) = fake_broker().await;
        config.queue_capacity = 1;
        config.forward_timeout_ms = 50;
        let broker = tokio::spawn(async move {
            let mut sock = accept_with_connack(&server, 0).await;
            answer_subscribe(&mut sock, 0x01).await;
            for i in 0..3 {
                let payload = format!(r#"{{"_type":"ping","n":{i}}}"#);
                sock.write_all(&publish_frame("owntracks/alice/phone1", payload.as_bytes()))
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut listener = Listener::new();
        let mut rx = listener.connect(&config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, br#"{"_type":"ping","n":0}"#.to_vec());
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert!(listener.is_connected(), "event loop must survive a full queue");
        broker.abort();
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let result = Listener::new().disconnect().await;
        assert!(matches!(result, Err(DisconnectError::NotConnected)));
    }

    #[tokio::test]
    async fn test_tls_without_ca_file() {
        let config = ConnectionConfig {
            tls: true,
            ..Default::default()
        };
        let result = Listener::new().connect(&config).await;
        assert!(matches!(result, Err(ConnectionError::Certificate(_))));
    }

    #[tokio::test]
    async fn test_tls_with_unusable_ca() {
        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        writeln!(garbage, "this is not a certificate").unwrap();

        for ca_file in [garbage.path().to_path_buf(), "/nonexistent/ca.crt".into()] {
            let config = ConnectionConfig {
                tls: true,
                ca_file: Some(ca_file),
                ..Default::default()
            };
            let result = Listener::new().connect(&config).await;
            assert!(matches!(result, Err(ConnectionError::Certificate(_))));
        }
    }

    #[test]
    fn test_options_fall_back_to_default_client_id() {
        let config = ConnectionConfig {
            client_id: " ".into(),
            username: Some("alice".into()),
            ..Default::default()
        };
        let opts = mqtt_options(&config).unwrap();
        assert_eq!(opts.client_id(), DEFAULT_CLIENT_ID);
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
    }

    fn test_ca_path() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/ca.pem")
    }

    #[test]
    fn test_load_ca_accepts_real_certificate() {
        let bytes = load_ca(Some(&test_ca_path())).unwrap();
        assert_eq!(bytes, std::fs::read(test_ca_path()).unwrap());
    }

    #[test]
    fn test_load_ca_rejects_corrupt_certificate() {
        let mut pem = tempfile::NamedTempFile::new().unwrap();
        writeln!(pem, "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----").unwrap();
        assert!(matches!(load_ca(Some(pem.path())), Err(ConnectionError::Certificate(_))));
    }

    #[tokio::test]
    async fn test_corrupt_ca_fails_before_dialing() {
        let (server, mut config) = fake_broker().await;
        let mut pem = tempfile::NamedTempFile::new().unwrap();
        writeln!(pem, "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----").unwrap();
        config.tls = true;
        config.ca_file = Some(pem.path().to_path_buf());

        let result = Listener::new().connect(&config).await;
        assert!(matches!(result, Err(ConnectionError::Certificate(_))));
        assert!(timeout(Duration::from_millis(200), server.accept()).await.is_err());
    }
}
