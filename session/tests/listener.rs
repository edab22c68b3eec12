mod common;

use std::sync::Arc;

use secure_session::binder::ChannelBinder;
use secure_session::channel::SessionChannel;
use secure_session::config::{ClientSessionConfig, ServerSessionConfig};
use secure_session::msgs::{Body, FaultCode, Message};
use secure_session::protocol::SecurityProtocol;
use secure_session::state::CommunicationState;
use secure_session::testutils::TagProtocol;
use secure_session::token::{ContextId, KeyGeneration};
use secure_session::SessionError;

use common::{setup_logging, spawn_echo_server, text, Fixture, TIMEOUT};

#[tokio::test]
async fn pending_sessions_are_limited() -> anyhow::Result<()> {
    setup_logging();
    let server = ServerSessionConfig {
        maximum_pending_sessions: 2,
        ..ServerSessionConfig::default()
    };
    let fx = Fixture::new(ClientSessionConfig::default(), server, 6000.0);
    let _a = fx.raw_session().await;
    let _b = fx.raw_session().await;
    assert_eq!(fx.listener.pending_count(), 2);

    let _c = fx.network.connect();
    let token = fx.tokens.issue(ContextId(77), KeyGeneration(1))?;
    let res = fx.listener.on_token_issued(token, "third").await;
    assert_eq!(res, Err(SessionError::CapacityExceeded { max: 2 }));
    assert_eq!(fx.listener.pending_count(), 2);
    assert_eq!(fx.network.server_binders()[2].abort_count(), 1);
    Ok(())
}

#[tokio::test]
async fn idle_pending_session_is_closed_by_the_second_sweep() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let _peer = fx.raw_session().await;
    let server_end = fx.network.server_binders()[0].clone();

    assert_eq!(fx.listener.sweep_pending_sessions().await, 0);
    assert_eq!(fx.listener.pending_count(), 1);
    assert_eq!(server_end.close_count(), 0);

    assert_eq!(fx.listener.sweep_pending_sessions().await, 1);
    assert_eq!(fx.listener.pending_count(), 0);
    assert_eq!(server_end.close_count(), 1);
    assert_eq!(fx.listener.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn first_message_makes_a_session_active() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let peer = fx.raw_session().await;
    let session = peer.token.context_id();
    assert!(fx.listener.active_session(session).is_none());

    peer.send(Message::application("echo", b"first".to_vec())).await;
    let channel = fx.listener.accept_channel(TIMEOUT).await?.expect("a session");
    assert_eq!(channel.session_id(), Some(session));
    assert_eq!(channel.state(), CommunicationState::Opened);
    // already opened by the listener
    channel.open(TIMEOUT).await?;

    assert_eq!(fx.listener.pending_count(), 0);
    assert_eq!(fx.listener.active_count(), 1);
    assert!(fx.listener.active_session(session).is_some());

    // a second issuance for the same session is refused
    let again = fx.tokens.issue(session, KeyGeneration(1))?;
    assert_eq!(
        fx.listener.on_token_issued(again, "again").await,
        Err(SessionError::AlreadyActive(session))
    );

    channel.abort();
    assert_eq!(channel.state(), CommunicationState::Closed);
    assert_eq!(fx.listener.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn renewal_of_unknown_session_fails() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let old = fx.tokens.issue(ContextId(5), KeyGeneration(1))?;
    let new = fx.tokens.issue(ContextId(5), KeyGeneration(2))?;
    assert_eq!(
        fx.listener.on_token_renewed(new, &old),
        Err(SessionError::SessionNotFound(ContextId(5)))
    );
    Ok(())
}

#[tokio::test]
async fn renewed_keys_waiting_for_use_are_bounded() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let peer = fx.raw_session().await;
    let session = peer.token.context_id();
    peer.send(Message::application("echo", b"first".to_vec())).await;
    let _channel = fx.listener.accept_channel(TIMEOUT).await?.expect("a session");

    let max = ServerSessionConfig::default().maximum_pending_keys_per_session;
    for generation in 2..2 + max as u64 {
        let new = fx.tokens.issue(session, KeyGeneration(generation))?;
        fx.listener.on_token_renewed(new, &peer.token)?;
    }
    let one_too_many = fx.tokens.issue(session, KeyGeneration(2 + max as u64))?;
    assert_eq!(
        fx.listener.on_token_renewed(one_too_many, &peer.token),
        Err(SessionError::TooManyPendingKeys { max })
    );

    // only the current key proves a renewal
    let newer = fx.tokens.issue(session, KeyGeneration(100))?;
    let stale = fx.tokens.issue(session, KeyGeneration(3))?;
    assert_eq!(
        fx.listener.on_token_renewed(newer, &stale),
        Err(SessionError::TokenNotCurrent)
    );
    Ok(())
}

#[tokio::test]
async fn tampered_message_gets_an_unsecured_security_fault() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let peer = fx.raw_session().await;

    peer.send(Message::application("echo", b"first".to_vec())).await;
    let channel = fx
        .listener
        .accept_channel(TIMEOUT)
        .await?
        .expect("a session")
        .into_reply()
        .expect("reply channel");
    let first = channel.receive_request(TIMEOUT).await?.expect("a request");
    assert_eq!(text(first.message()), "first");

    let (mut tampered, _) = TagProtocol
        .secure_outgoing(
            Message::application("echo", b"pay me".to_vec()),
            &peer.token,
            TIMEOUT,
        )
        .await?;
    tampered.body = Body::Payload(b"pay me twice".to_vec());

    let server = tokio::spawn(async move {
        let next = channel.receive_request(TIMEOUT).await?;
        anyhow::Ok((next.is_some(), channel))
    });
    let fault = peer.binder.request(tampered, TIMEOUT).await?;
    assert!(!fault.is_secured());
    assert_eq!(
        fault.as_fault().map(|f| f.code),
        Some(FaultCode::SecurityError)
    );

    // the channel keeps serving after dropping the message
    peer.send(Message::application("echo", b"honest".to_vec())).await;
    let (got_next, channel) = server.await??;
    assert!(got_next);
    assert_eq!(channel.state(), CommunicationState::Opened);
    Ok(())
}

#[tokio::test]
async fn stopped_listener_refuses_new_sessions() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let server = spawn_echo_server(fx.listener.clone());

    let established = fx.client.create_request_channel(fx.network.connect());
    established.open(TIMEOUT).await?;
    established
        .request(Message::application("echo", b"before".to_vec()), TIMEOUT)
        .await?;

    fx.listener.stop_accepting_new_work();
    let late = fx.client.create_request_channel(fx.network.connect());
    assert_eq!(late.open(TIMEOUT).await, Err(SessionError::ListenerClosing));

    // sessions that were already established carry on
    let reply = established
        .request(Message::application("echo", b"after".to_vec()), TIMEOUT)
        .await?;
    assert_eq!(text(&reply), "AFTER");
    established.close(TIMEOUT).await?;
    assert_eq!(server.await??, 2);
    Ok(())
}

#[tokio::test]
async fn closing_the_listener_closes_pending_sessions() -> anyhow::Result<()> {
    setup_logging();
    let fx = Fixture::with_defaults();
    let _peer = fx.raw_session().await;
    let server_end: Arc<dyn ChannelBinder> = fx.network.server_binders()[0].clone();

    fx.listener.close(TIMEOUT).await?;
    assert_eq!(fx.listener.pending_count(), 0);
    assert_eq!(fx.network.server_binders()[0].close_count(), 1);
    assert!(matches!(
        server_end.try_receive(TIMEOUT).await?,
        secure_session::binder::TryReceive::Closed
    ));
    assert_eq!(fx.listener.accept_channel(TIMEOUT).await?.map(|_| ()), None);

    let token = fx.tokens.issue(ContextId(8), KeyGeneration(1))?;
    assert_eq!(
        fx.listener.on_token_issued(token, "late").await,
        Err(SessionError::ListenerClosing)
    );
    Ok(())
}
