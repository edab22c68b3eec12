#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use secure_session::binder::{ChannelBinder, TryReceive};
use secure_session::channel::SessionChannel;
use secure_session::client::{ClientSessionSettings, DuplexSessionChannel};
use secure_session::config::{ClientSessionConfig, ServerSessionConfig};
use secure_session::msgs::Message;
use secure_session::protocol::SecurityProtocol;
use secure_session::server::{ServerSessionChannel, ServerSessionSettings};
use secure_session::testutils::{
    loopback_pair, LoopbackBinder, LoopbackNetwork, ManualClock, TagProtocol,
    TagProtocolFactory, TestTokenService,
};
use secure_session::token::{ContextId, KeyGeneration, SessionToken};
use secure_session_util::time::Timing;
use tokio::task::JoinHandle;

pub const T: Timing = 1_000_000.0;
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_logging() {
    use std::io::Write;
    let mut log_builder = env_logger::Builder::from_default_env(); // sets log level filter from environment (or defaults)
    log_builder.filter_level(log::LevelFilter::Debug);
    log_builder.format_timestamp_nanos();
    log_builder.format(|buf, record| {
        let ts_format = buf.timestamp_nanos().to_string();
        writeln!(
            buf,
            "\x1b[1m{:?}\x1b[0m {}: {}",
            std::thread::current().id(),
            &ts_format[14..],
            record.args()
        )
    });

    let _ = log_builder.try_init();
}

/// A listener and a client settings object sharing one manual clock and one
/// loopback network
pub struct Fixture {
    pub clock: ManualClock,
    pub network: Arc<LoopbackNetwork>,
    pub listener: ServerSessionSettings,
    pub tokens: Arc<TestTokenService>,
    pub client: ClientSessionSettings,
}

impl Fixture {
    pub fn new(client: ClientSessionConfig, server: ServerSessionConfig, lifetime: Timing) -> Self {
        let clock = ManualClock::new(T);
        let network = Arc::new(LoopbackNetwork::new());
        let protocols = Arc::new(TagProtocolFactory);
        let listener = ServerSessionSettings::new(
            server,
            protocols.clone(),
            network.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let tokens = Arc::new(
            TestTokenService::new(clock.clone(), lifetime).with_listener(listener.clone()),
        );
        let client =
            ClientSessionSettings::new(client, tokens.clone(), protocols, Arc::new(clock.clone()))
                .unwrap();
        Self {
            clock,
            network,
            listener,
            tokens,
            client,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            ClientSessionConfig::default(),
            ServerSessionConfig::default(),
            6000.0,
        )
    }

    /// A client end whose session is issued and pending on the listener,
    /// for tests that talk to the server without a client channel
    pub async fn raw_session(&self) -> RawPeer {
        let binder = self.network.connect();
        let token = self
            .tokens
            .issue(ContextId(rand::random()), KeyGeneration(1))
            .unwrap();
        self.listener
            .on_token_issued(token.clone(), "raw-peer")
            .await
            .unwrap();
        RawPeer { binder, token }
    }
}

/// An opened duplex client channel whose server is played by hand
pub struct HandServed {
    pub channel: DuplexSessionChannel,
    /// The client's end of the transport
    pub client_end: Arc<LoopbackBinder>,
    /// Holds the server's end and the client's session token
    pub server: RawPeer,
    pub tokens: Arc<TestTokenService>,
}

impl HandServed {
    pub async fn open(config: ClientSessionConfig, tokens: TestTokenService) -> Self {
        let tokens = Arc::new(tokens);
        let settings = ClientSessionSettings::new(
            config,
            tokens.clone(),
            Arc::new(TagProtocolFactory),
            Arc::new(ManualClock::new(T)),
        )
        .unwrap();
        let (client_end, server_end) = loopback_pair();
        let channel = settings.create_duplex_channel(client_end.clone());
        channel.open(TIMEOUT).await.unwrap();
        let token = tokens.issued_tokens()[0].clone();
        Self {
            channel,
            client_end,
            server: RawPeer {
                binder: server_end,
                token,
            },
            tokens,
        }
    }

    pub async fn with_defaults() -> Self {
        let tokens = TestTokenService::new(ManualClock::new(T), 6000.0);
        Self::open(ClientSessionConfig::default(), tokens).await
    }
}

/// A peer that secures its messages by hand
pub struct RawPeer {
    pub binder: Arc<LoopbackBinder>,
    pub token: SessionToken,
}

impl RawPeer {
    pub async fn secure(&self, message: Message) -> Message {
        TagProtocol
            .secure_outgoing(message, &self.token, TIMEOUT)
            .await
            .unwrap()
            .0
    }

    pub async fn send(&self, message: Message) {
        let secured = self.secure(message).await;
        self.binder.send(secured, TIMEOUT).await.unwrap();
    }

    pub async fn receive(&self) -> Message {
        match self.binder.try_receive(TIMEOUT).await.unwrap() {
            TryReceive::Received(ctx) => ctx.into_message(),
            other => panic!("expected a message, got {other:?}"),
        }
    }
}

/// Serve the first accepted session, echoing every message in upper case
/// until the client closes. Returns the number of messages served.
pub fn spawn_echo_server(listener: ServerSessionSettings) -> JoinHandle<anyhow::Result<usize>> {
    tokio::spawn(async move {
        let channel = listener
            .accept_channel(TIMEOUT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("listener closed"))?;
        let mut served = 0;
        match &channel {
            ServerSessionChannel::Reply(reply) => {
                while let Some(request) = reply.receive_request(TIMEOUT).await? {
                    let answer = echo(request.message());
                    request.reply(answer, TIMEOUT).await?;
                    served += 1;
                }
            }
            ServerSessionChannel::Duplex(duplex) => {
                while let Some(message) = duplex.receive(TIMEOUT).await? {
                    duplex.send(echo(&message), TIMEOUT).await?;
                    served += 1;
                }
            }
        }
        channel.close(TIMEOUT).await?;
        Ok(served)
    })
}

pub fn echo(message: &Message) -> Message {
    let text = String::from_utf8_lossy(message.payload().unwrap_or_default()).to_uppercase();
    Message::application("echo", text.into_bytes())
}

pub fn text(message: &Message) -> String {
    String::from_utf8_lossy(message.payload().unwrap_or_default()).into_owned()
}
