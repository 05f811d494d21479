//! Accepts one client at a time and drives its [`Connection`] to completion
//! (spec §2 "Listener", §5 server thread 1; SPEC_FULL.md §D.4 "graceful
//! listener shutdown").
//!
//! Multi-client fan-out is an explicit Non-goal (spec §1): the accept loop
//! processes a connection to the end before accepting the next one, rather
//! than spawning it off to run concurrently with future accepts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, instrument, warn};

use crate::clock::LocalClock;
use crate::local_cert::LocalCert;

use super::connection::{Connection, PinPrompt, StreamFactory};
use super::known_clients::KnownClients;
use super::tls::build_acceptor;

/// A cloneable handle that triggers the listener's graceful shutdown from
/// outside the accept loop (e.g. a `SIGINT` handler in the server binary).
#[derive(Clone)]
pub struct ListenerShutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ListenerShutdown {
    /// Requests shutdown. The accept loop stops taking new connections as
    /// soon as it is next free to check — immediately if it is waiting on
    /// `accept()`, or after the in-progress `Connection` finishes otherwise
    /// (SPEC_FULL.md §D.4).
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    identity: Arc<LocalCert>,
    known_clients: Arc<KnownClients>,
    pin_prompt: Arc<dyn PinPrompt>,
    stream_factory: Arc<dyn StreamFactory>,
    clock: Arc<LocalClock>,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        identity: Arc<LocalCert>,
        known_clients: Arc<KnownClients>,
        pin_prompt: Arc<dyn PinPrompt>,
        stream_factory: Arc<dyn StreamFactory>,
    ) -> anyhow::Result<Listener> {
        let tcp = TcpListener::bind(addr).await?;
        let acceptor = build_acceptor(&identity)?;
        info!(%addr, "listening");
        Ok(Listener {
            tcp,
            acceptor,
            identity,
            known_clients,
            pin_prompt,
            stream_factory,
            clock: Arc::new(LocalClock::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn shutdown_handle(&self) -> ListenerShutdown {
        ListenerShutdown { flag: self.shutting_down.clone(), notify: self.shutdown_notify.clone() }
    }

    /// Runs the accept loop until shutdown is triggered. A single client's
    /// failure (spec §7 "the listener never propagates a single-client
    /// error") never ends this loop.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Ok(());
            }

            let accept = self.tcp.accept();
            tokio::pin!(accept);
            tokio::select! {
                biased;
                _ = self.shutdown_notify.notified() => return Ok(()),
                res = &mut accept => {
                    match res {
                        Ok((stream, peer_addr)) => self.handle_one(stream, peer_addr).await,
                        Err(e) => {
                            warn!(error = %e, "accept failed; listener continues");
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self, stream))]
    async fn handle_one(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let tls_stream = match self.acceptor.accept(stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, %peer_addr, "TLS accept failed");
                return;
            }
        };

        let peer_cert_der = match tls_stream.get_ref().1.peer_certificates() {
            Some([first, ..]) => first.as_ref().to_vec(),
            _ => {
                warn!(%peer_addr, "client presented no certificate; rejecting");
                return;
            }
        };

        let connection = Connection::new(
            self.identity.clone(),
            self.known_clients.clone(),
            self.pin_prompt.clone(),
            self.stream_factory.clone(),
            self.clock.clone(),
        );

        info!(%peer_addr, "client connected");
        match connection.run(tls_stream, peer_cert_der).await {
            Ok(()) => info!(%peer_addr, "client session ended"),
            Err(e) => error!(%peer_addr, error = %e, "client session ended with error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioEncoder, HostCaps, VideoCodec, VideoCodecMask, VideoEncoder};
    use crate::capture::{FrameSource, Scaler};
    use crate::rational::Rational;
    use crate::server::capture_pipeline::StreamConfig;
    use crate::protocol::{Packet, PacketReader, PacketWriter, PROTOCOL_VERSION};
    use crate::protocol::message::ServerIntroStatus;

    struct NoopStreamFactory;
    impl StreamFactory for NoopStreamFactory {
        fn host_caps(&self, _codec: VideoCodec) -> HostCaps {
            HostCaps {
                native_width: 1920,
                native_height: 1080,
                native_fps: Rational::new(60, 1),
                max_width: 1920,
                max_height: 1080,
                supported_video: VideoCodecMask::empty().with(VideoCodec::H264),
            }
        }
        fn build_source(&self) -> anyhow::Result<Box<dyn FrameSource>> {
            anyhow::bail!("not implemented in test double")
        }
        fn build_scaler(&self, _cfg: StreamConfig) -> anyhow::Result<Box<dyn Scaler>> {
            anyhow::bail!("not implemented in test double")
        }
        fn build_video_encoder(&self, _cfg: StreamConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
            anyhow::bail!("not implemented in test double")
        }
        fn build_audio_encoder(&self) -> anyhow::Result<Box<dyn AudioEncoder>> {
            anyhow::bail!("not implemented in test double")
        }
    }

    struct AutoRejectPin;
    impl PinPrompt for AutoRejectPin {
        fn prompt(&self, _pin_display: &str) -> Option<u32> {
            None
        }
    }

    fn tempdir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("twilight-listener-test-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn version_mismatch_closes_connection_and_listener_stays_up() {
        let dir = tempdir("version-mismatch");
        let identity =
            Arc::new(LocalCert::load_or_generate(&dir.join("key.der"), &dir.join("cert.der"), "twilight-test", "localhost").unwrap());
        let known_clients = Arc::new(KnownClients::load(&dir.join("clients.toml")).unwrap());

        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            identity.clone(),
            known_clients,
            Arc::new(AutoRejectPin),
            Arc::new(NoopStreamFactory),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = listener.shutdown_handle();

        let server_task = tokio::spawn(async move { listener.run().await });

        let client_identity = Arc::new(
            LocalCert::load_or_generate(&dir.join("client-key.der"), &dir.join("client-cert.der"), "twilight-test", "client")
                .unwrap(),
        );
        let connector = crate::client::tls::build_connector(&client_identity, None).unwrap();
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_name = crate::client::tls::server_name_for("localhost").unwrap();
        let mut tls = connector.connect(server_name, tcp).await.unwrap();

        let mut writer = PacketWriter::new(&mut tls);
        writer.write_packet(&Packet::ClientIntro { protocol_version: PROTOCOL_VERSION + 1 }, &[]).await.unwrap();
        let mut reader = PacketReader::new(&mut tls);
        let (packet, _) = reader.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::ServerIntro { status: ServerIntroStatus::VersionMismatch, .. }));

        shutdown.trigger();
        let _ = server_task.await.unwrap();
    }
}
