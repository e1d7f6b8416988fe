//! End-to-end behaviour of the chat bus core on an in-process transport

use chatbus::auth::{Authenticity, SharedSecret, TokenSigner, Verifier};
use chatbus::bus::{
    AuthPolicy, ChatBusClient, ClientIdentity, EventBus, InboundMessage, LineHandler,
    GENERAL_CHANNEL,
};
use chatbus::channels::Channel;
use chatbus::cluster::Envelope;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_SECRET: &str = "s3cret";

fn general() -> Channel {
    Channel::parse(GENERAL_CHANNEL).unwrap()
}

fn signed_client(bus: &EventBus, handle: &str) -> ChatBusClient {
    let secret = SharedSecret::new(TEST_SECRET);
    let identity = ClientIdentity::signed(handle, &secret).unwrap();
    ChatBusClient::new(bus.clone(), identity).with_verifier(Verifier::new(secret))
}

fn collector() -> (
    impl Fn(&InboundMessage) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<InboundMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |msg: &InboundMessage| {
            let _ = tx.send(msg.clone());
        },
        rx,
    )
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("message within 1s")
        .expect("subscription open")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected delivery");
}

/// Writer shared between the handler and the test
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_fan_out_to_every_subscription() {
    let bus = EventBus::local();
    let alice = signed_client(&bus, "alice");
    let listener = signed_client(&bus, "listener");

    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    let _sub1 = listener.subscribe(&general(), first);
    let _sub2 = listener.subscribe(&general(), second);

    alice.publish(&general(), "hi all");

    for rx in [&mut first_rx, &mut second_rx] {
        let msg = recv(rx).await;
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.body, "hi all");
        assert_eq!(msg.authenticity, Authenticity::Verified);
        assert_silent(rx).await;
    }
}

#[tokio::test]
async fn test_cancelled_subscription_gets_nothing_sibling_still_does() {
    let bus = EventBus::local();
    let alice = signed_client(&bus, "alice");

    let (cancelled, mut cancelled_rx) = collector();
    let (sibling, mut sibling_rx) = collector();
    let sub = alice.subscribe(&general(), cancelled);
    let _sibling = alice.subscribe(&general(), sibling);

    sub.cancel();
    sub.cancel();
    alice.publish(&general(), "after cancel");

    assert_eq!(recv(&mut sibling_rx).await.body, "after cancel");
    assert_silent(&mut cancelled_rx).await;
}

#[tokio::test]
async fn test_default_line_output() {
    let bus = EventBus::local();
    let bob = signed_client(&bus, "bob");
    let reader = signed_client(&bus, "reader");

    let out = SharedBuf::default();
    let _sub = reader.subscribe(&general(), LineHandler::new(out.clone()));

    bob.publish(&general(), "hello");

    timeout(Duration::from_secs(1), async {
        while !out.contents().contains('\n') {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("line written");
    assert_eq!(out.contents(), "[general:bob] hello\n");
}

#[tokio::test]
async fn test_forged_token_dropped() {
    let bus = EventBus::local();
    let listener = signed_client(&bus, "listener");
    let (handler, mut rx) = collector();
    let _sub = listener.subscribe(&general(), handler);

    // Token signed for bob, claimed by mallory
    let bob_token = TokenSigner::sign(&SharedSecret::new(TEST_SECRET), "bob").unwrap();
    bus.publish(Envelope::chat(general(), "trust me", "mallory", Some(bob_token.as_str())));

    // Token signed with the wrong secret
    let wrong = TokenSigner::sign(&SharedSecret::new("guess"), "eve").unwrap();
    bus.publish(Envelope::chat(general(), "me too", "eve", Some(wrong.as_str())));

    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_unsigned_flagged_or_dropped_by_policy() {
    let bus = EventBus::local();
    let anonymous = ChatBusClient::new(bus.clone(), ClientIdentity::unsigned("anon"));

    let permissive = signed_client(&bus, "permissive");
    let strict = signed_client(&bus, "strict").with_policy(AuthPolicy::Strict);

    let (lenient, mut lenient_rx) = collector();
    let (picky, mut picky_rx) = collector();
    let _a = permissive.subscribe(&general(), lenient);
    let _b = strict.subscribe(&general(), picky);

    anonymous.publish(&general(), "no token");

    let msg = recv(&mut lenient_rx).await;
    assert_eq!(msg.sender, "anon");
    assert_eq!(msg.token, None);
    assert_eq!(msg.authenticity, Authenticity::Unsigned);
    assert_silent(&mut picky_rx).await;
}

#[tokio::test]
async fn test_without_verifier_messages_are_unchecked() {
    let bus = EventBus::local();
    let bob = signed_client(&bus, "bob");
    let plain = ChatBusClient::new(bus.clone(), ClientIdentity::unsigned("plain"));

    let (handler, mut rx) = collector();
    let _sub = plain.subscribe(&general(), handler);
    bob.publish(&general(), "hi");

    let msg = recv(&mut rx).await;
    assert_eq!(msg.authenticity, Authenticity::Unchecked);
    assert!(msg.token.is_some());
}

#[tokio::test]
async fn test_single_publisher_order_preserved() {
    let bus = EventBus::local();
    let alice = signed_client(&bus, "alice");
    let (handler, mut rx) = collector();
    let _sub = alice.subscribe(&general(), handler);

    for i in 0..200 {
        alice.publish(&general(), i.to_string());
    }
    for i in 0..200 {
        assert_eq!(recv(&mut rx).await.body, i.to_string());
    }
}

#[tokio::test]
async fn test_reply_reaches_requester() {
    let bus = EventBus::local();
    let server = signed_client(&bus, "server");
    let asker = signed_client(&bus, "asker");

    let responder = server.clone();
    let _serve = server.subscribe(&general(), move |msg: &InboundMessage| {
        if msg.reply_to.is_some() {
            responder.reply(msg, format!("echo: {}", msg.body)).unwrap();
        }
    });

    let inbox = Channel::parse("asker.inbox").unwrap();
    let (handler, mut rx) = collector();
    let _inbox = asker.subscribe(&inbox, handler);

    asker.publish_with_reply(&general(), "ping", &inbox);

    let reply = recv(&mut rx).await;
    assert_eq!(reply.body, "echo: ping");
    assert_eq!(reply.sender, "server");
    assert_eq!(reply.authenticity, Authenticity::Verified);
}

#[tokio::test]
async fn test_channels_do_not_leak() {
    let bus = EventBus::local();
    let alice = signed_client(&bus, "alice");
    let (handler, mut rx) = collector();
    let _sub = alice.subscribe(&general(), handler);

    alice.publish(&Channel::parse("other-channel").unwrap(), "elsewhere");
    assert_silent(&mut rx).await;
}
