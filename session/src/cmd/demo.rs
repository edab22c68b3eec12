use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use secure_session_util::time::{Clock, SystemClock};

use super::Command;
use crate::channel::SessionChannel;
use crate::cli;
use crate::client::{
    ClientSessionChannel, ClientSessionSettings, DuplexSessionChannel, RequestSessionChannel,
};
use crate::config::{ClientChannelKind, ServerChannelKind, SessionConfig};
use crate::msgs::Message;
use crate::server::{ServerSessionChannel, ServerSessionSettings};
use crate::testutils::{LoopbackNetwork, TagProtocolFactory, TestTokenService};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

impl Command for cli::Demo {
    fn run(self) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("could not load config file {path:?}"))?,
            None => SessionConfig::default(),
        };
        (config.client.channel_kind, config.server.channel_kind) = match self.duplex {
            true => (ClientChannelKind::Duplex, ServerChannelKind::Duplex),
            false => (ClientChannelKind::Request, ServerChannelKind::Reply),
        };
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(run_demo(config, self.messages))
    }
}

fn text(message: &Message) -> String {
    String::from_utf8_lossy(message.payload().unwrap_or_default()).into_owned()
}

async fn run_demo(config: SessionConfig, messages: usize) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let network = Arc::new(LoopbackNetwork::new());
    let protocols = Arc::new(TagProtocolFactory);

    let listener = ServerSessionSettings::new(
        config.server.clone(),
        protocols.clone(),
        network.clone(),
        clock.clone(),
    )?;
    listener.open();

    let tokens = Arc::new(
        TestTokenService::new(SystemClock, config.client.key_renewal_interval)
            .with_listener(listener.clone()),
    );
    let client = ClientSessionSettings::new(config.client.clone(), tokens, protocols, clock)?;

    let server = tokio::spawn(serve(listener.clone()));
    match client.create_channel(network.connect()) {
        ClientSessionChannel::Request(channel) => run_requests(channel, messages).await?,
        ClientSessionChannel::Duplex(channel) => run_duplex(channel, messages).await?,
    }
    server.await??;

    listener.close(STEP_TIMEOUT).await?;
    info!("demo finished");
    Ok(())
}

/// Echo every message in upper case until the client closes
async fn serve(listener: ServerSessionSettings) -> Result<()> {
    let channel = listener
        .accept_channel(STEP_TIMEOUT)
        .await?
        .context("listener closed before a session arrived")?;
    let session = channel.session_id();
    match &channel {
        ServerSessionChannel::Reply(reply) => {
            while let Some(request) = reply.receive_request(STEP_TIMEOUT).await? {
                let received = text(request.message());
                info!("server: request {received:?} under key {}", channel.current_key());
                let answer = Message::application("echo", received.to_uppercase().into_bytes());
                request.reply(answer, STEP_TIMEOUT).await?;
            }
        }
        ServerSessionChannel::Duplex(duplex) => {
            while let Some(message) = duplex.receive(STEP_TIMEOUT).await? {
                let received = text(&message);
                info!("server: message {received:?} under key {}", channel.current_key());
                let answer = Message::application("echo", received.to_uppercase().into_bytes());
                duplex.send(answer, STEP_TIMEOUT).await?;
            }
        }
    }
    info!("server: client closed session {session:?}");
    channel.close(STEP_TIMEOUT).await?;
    Ok(())
}

fn renew_before(i: usize, messages: usize) -> bool {
    i > 0 && i == messages / 2
}

async fn run_requests(channel: RequestSessionChannel, messages: usize) -> Result<()> {
    channel.open(STEP_TIMEOUT).await?;
    for i in 0..messages {
        if renew_before(i, messages) {
            channel.renew_key(STEP_TIMEOUT).await?;
            info!("client: renewed the session key");
        }
        let request = Message::application("echo", format!("message {i}").into_bytes());
        let reply = channel.request(request, STEP_TIMEOUT).await?;
        info!("client: reply {:?}", text(&reply));
    }
    channel.close(STEP_TIMEOUT).await?;
    info!("client: session closed");
    Ok(())
}

async fn run_duplex(channel: DuplexSessionChannel, messages: usize) -> Result<()> {
    channel.open(STEP_TIMEOUT).await?;
    for i in 0..messages {
        if renew_before(i, messages) {
            channel.renew_key(STEP_TIMEOUT).await?;
            info!("client: renewed the session key");
        }
        let message = Message::application("echo", format!("message {i}").into_bytes());
        channel.send(message, STEP_TIMEOUT).await?;
        let answer = channel
            .receive(STEP_TIMEOUT)
            .await?
            .context("server closed the session early")?;
        info!("client: received {:?}", text(&answer));
    }
    channel.close(STEP_TIMEOUT).await?;
    info!("client: session closed");
    Ok(())
}
