mod common;

use secure_session::channel::SessionChannel;
use secure_session::config::{ClientSessionConfig, ServerSessionConfig};
use secure_session::msgs::Message;
use secure_session::state::CommunicationState;
use secure_session::token::KeyGeneration;

use common::{setup_logging, spawn_echo_server, text, Fixture, TIMEOUT};

fn request(i: usize) -> Message {
    Message::application("echo", format!("message {i}").into_bytes())
}

/// A key renewal interval of ten minutes on a token valid for 100 minutes
/// renews after ten minutes, exactly once, before the next message goes out
#[tokio::test]
async fn key_is_renewed_before_it_is_used_past_its_renewal_time() -> anyhow::Result<()> {
    setup_logging();
    let client = ClientSessionConfig {
        key_renewal_interval: 10.0 * 60.0,
        ..ClientSessionConfig::default()
    };
    let fx = Fixture::new(client, ServerSessionConfig::default(), 100.0 * 60.0);
    let server = spawn_echo_server(fx.listener.clone());

    let channel = fx.client.create_request_channel(fx.network.connect());
    channel.open(TIMEOUT).await?;
    let session = channel.session_id().expect("opened channel has a session");

    let reply = channel.request(request(0), TIMEOUT).await?;
    assert_eq!(text(&reply), "MESSAGE 0");
    assert_eq!(fx.tokens.renew_calls(), 0);

    fx.clock.advance(10.0 * 60.0 - 1.0);
    channel.request(request(1), TIMEOUT).await?;
    assert_eq!(fx.tokens.renew_calls(), 0);

    fx.clock.advance(1.0);
    channel.request(request(2), TIMEOUT).await?;
    assert_eq!(fx.tokens.renew_calls(), 1);

    // the server only promotes a key once a message under it arrived
    let server_channel = fx.listener.active_session(session).expect("session is active");
    assert_eq!(server_channel.current_key().key_generation, KeyGeneration(2));

    channel.request(request(3), TIMEOUT).await?;
    assert_eq!(fx.tokens.renew_calls(), 1);

    channel.close(TIMEOUT).await?;
    assert_eq!(server.await??, 4);
    assert_eq!(channel.state(), CommunicationState::Closed);
    assert_eq!(fx.listener.active_count(), 0);
    Ok(())
}

/// The server caps key lifetime tighter than the client; the client learns
/// about it from a renew-needed fault, renews and the request goes through
#[tokio::test]
async fn renew_needed_fault_triggers_renewal_and_retry() -> anyhow::Result<()> {
    setup_logging();
    let client = ClientSessionConfig {
        key_renewal_interval: 3600.0,
        ..ClientSessionConfig::default()
    };
    let server = ServerSessionConfig {
        maximum_key_renewal_interval: 600.0,
        ..ServerSessionConfig::default()
    };
    let fx = Fixture::new(client, server, 6000.0);
    let server = spawn_echo_server(fx.listener.clone());

    let channel = fx.client.create_request_channel(fx.network.connect());
    channel.open(TIMEOUT).await?;
    channel.request(request(0), TIMEOUT).await?;

    fx.clock.advance(700.0);
    let reply = channel.request(request(1), TIMEOUT).await?;
    assert_eq!(text(&reply), "MESSAGE 1");
    assert_eq!(fx.tokens.renew_calls(), 1);
    assert_eq!(channel.state(), CommunicationState::Opened);

    channel.close(TIMEOUT).await?;
    // the rejected attempt never reached the application
    assert_eq!(server.await??, 2);
    Ok(())
}

#[tokio::test]
async fn explicit_renewal_is_picked_up_by_the_server() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let server = spawn_echo_server(fx.listener.clone());

    let channel = fx.client.create_duplex_channel(fx.network.connect());
    channel.open(TIMEOUT).await?;
    let session = channel.session_id().expect("opened channel has a session");

    channel.send(request(0), TIMEOUT).await?;
    assert_eq!(text(&channel.receive(TIMEOUT).await?.expect("echo")), "MESSAGE 0");

    let server_channel = fx.listener.active_session(session).expect("session is active");
    channel.renew_key(TIMEOUT).await?;
    assert_eq!(fx.tokens.renew_calls(), 1);
    assert_eq!(server_channel.current_key().key_generation, KeyGeneration(1));

    channel.send(request(1), TIMEOUT).await?;
    assert_eq!(text(&channel.receive(TIMEOUT).await?.expect("echo")), "MESSAGE 1");
    assert_eq!(server_channel.current_key().key_generation, KeyGeneration(2));

    channel.close(TIMEOUT).await?;
    assert_eq!(server.await??, 2);
    Ok(())
}

#[tokio::test]
async fn renewal_refused_by_configuration() -> anyhow::Result<()> {
    setup_logging();
    let client = ClientSessionConfig {
        key_renewal_interval: 600.0,
        can_renew_session: false,
        ..ClientSessionConfig::default()
    };
    let fx = Fixture::new(client, ServerSessionConfig::default(), 6000.0);
    let _server = spawn_echo_server(fx.listener.clone());

    let channel = fx.client.create_request_channel(fx.network.connect());
    channel.open(TIMEOUT).await?;
    channel.request(request(0), TIMEOUT).await?;

    fx.clock.advance(600.0);
    let res = channel.request(request(1), TIMEOUT).await;
    assert!(matches!(
        res,
        Err(secure_session::SessionError::SessionKeyExpired(_))
    ));
    assert_eq!(fx.tokens.renew_calls(), 0);
    assert_eq!(channel.state(), CommunicationState::Faulted);
    Ok(())
}
