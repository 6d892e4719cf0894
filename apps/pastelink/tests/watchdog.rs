use std::sync::Arc;
use std::time::Duration;

use pastelink_core::config::Config;
use pastelink_core::controller::driver::{DriverError, SessionDriver, SessionHandle};
use pastelink_core::controller::{ConnectionController, Notice, RecoveryAction};
use pastelink_core::protocol::{RetryPolicy, SendError};
use pastelink_core::session::{Phase, Role};
use pastelink_core::store::{MemoryStateStore, StateStore};
use pastelink_core::transport::mock::{ChannelOpening, MockBehavior, MockNetwork};
use pastelink_core::watchdog::{RECEIVER_FALLBACK_LABEL, SENDER_FALLBACK_LABEL};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep, timeout};

fn spawn(network: &Arc<MockNetwork>) -> (SessionHandle, Arc<MemoryStateStore>) {
    spawn_with(network, Config::default())
}

fn spawn_with(
    network: &Arc<MockNetwork>,
    config: Config,
) -> (SessionHandle, Arc<MemoryStateStore>) {
    let store = Arc::new(MemoryStateStore::new());
    let controller = ConnectionController::new(
        Arc::new(network.transport()),
        Arc::clone(&store) as Arc<dyn StateStore>,
        config,
    );
    (SessionDriver::spawn(controller), store)
}

async fn phase_reached(notices: &mut broadcast::Receiver<Notice>, wanted: Phase) {
    loop {
        match notices.recv().await.expect("notice stream closed") {
            Notice::PhaseChanged { phase, .. } if phase == wanted => return,
            _ => {}
        }
    }
}

/// Exchanges codes so both sides are `Connecting`.
async fn connect(sender: &SessionHandle, receiver: &SessionHandle) {
    let offer = sender.initiate().await.unwrap();
    let answer = receiver.submit_offer(offer.as_str()).await.unwrap();
    sender.submit_answer(answer.as_str()).await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn stalled_channel_fails_within_the_budget() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::Never,
        ..MockBehavior::default()
    });
    let (sender, _) = spawn(&network);
    let (receiver, _) = spawn(&network);
    let mut sender_notices = sender.subscribe();
    let mut receiver_notices = receiver.subscribe();

    connect(&sender, &receiver).await;
    let started = Instant::now();

    phase_reached(&mut receiver_notices, Phase::Failed).await;
    let receiver_elapsed = started.elapsed();
    assert!(receiver_elapsed > Duration::from_secs(15));
    assert!(receiver_elapsed <= Duration::from_secs(16));

    phase_reached(&mut sender_notices, Phase::Failed).await;
    let sender_elapsed = started.elapsed();
    assert!(sender_elapsed > Duration::from_secs(20));
    assert!(sender_elapsed <= Duration::from_secs(21));

    // primary channel plus one fallback per side
    assert_eq!(network.channels_created(), 3);

    // supervision is over: no more ticks, no more channels
    sleep(Duration::from_secs(30)).await;
    assert_eq!(network.channels_created(), 3);
    assert_eq!(sender.snapshot().await.unwrap().phase, Phase::Failed);
    assert_eq!(receiver.snapshot().await.unwrap().phase, Phase::Failed);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failure_names_the_recovery_for_each_role() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::Never,
        ..MockBehavior::default()
    });
    let (sender, _) = spawn(&network);
    let (receiver, _) = spawn(&network);
    let mut sender_notices = sender.subscribe();
    let mut receiver_notices = receiver.subscribe();

    connect(&sender, &receiver).await;
    network.fail_links();

    let mut recoveries = Vec::new();
    for notices in [&mut sender_notices, &mut receiver_notices] {
        loop {
            if let Notice::RecoveryRequired { role, action } = notices.recv().await.unwrap() {
                recoveries.push((role, action));
                break;
            }
        }
    }
    assert_eq!(
        recoveries,
        vec![
            (Role::Sender, RecoveryAction::GenerateNewCode),
            (Role::Receiver, RecoveryAction::Reconnect),
        ]
    );
    // the link failure ends the attempt before any fallback
    assert_eq!(network.channels_created(), 1);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn receiver_fallback_rescues_a_stalled_channel() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::AfterFirst,
        ..MockBehavior::default()
    });
    let (sender, _) = spawn(&network);
    let (receiver, receiver_store) = spawn(&network);
    let mut sender_notices = sender.subscribe();
    let mut receiver_notices = receiver.subscribe();

    connect(&sender, &receiver).await;
    let started = Instant::now();

    let label = loop {
        if let Notice::ChannelRecreated { role, label } = receiver_notices.recv().await.unwrap() {
            assert_eq!(role, Role::Receiver);
            break label;
        }
    };
    assert_eq!(label, RECEIVER_FALLBACK_LABEL);
    phase_reached(&mut receiver_notices, Phase::Open).await;
    phase_reached(&mut sender_notices, Phase::Open).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    // the sender adopted the receiver's channel instead of making its own
    assert_eq!(network.channels_created(), 2);
    let sender_view = sender.snapshot().await.unwrap();
    assert!(sender_view.channel_open);

    sender.send_credential("hunter2").await.unwrap();
    loop {
        if let Notice::CredentialReceived = receiver_notices.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(
        receiver_store.credential().await.unwrap().as_deref(),
        Some("hunter2")
    );

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn sender_fallback_fires_once_while_connected() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::Never,
        ..MockBehavior::default()
    });
    let (sender, _) = spawn(&network);
    let (receiver, _) = spawn(&network);
    let mut sender_notices = sender.subscribe();

    connect(&sender, &receiver).await;

    let mut recreated = Vec::new();
    let outcome = timeout(Duration::from_secs(30), async {
        loop {
            match sender_notices.recv().await.unwrap() {
                Notice::ChannelRecreated { label, .. } => recreated.push(label),
                Notice::PhaseChanged {
                    phase: Phase::Failed,
                    ..
                } => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(outcome.is_ok());
    assert_eq!(recreated, vec![SENDER_FALLBACK_LABEL.to_string()]);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reconnect_after_failure_starts_over() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::Never,
        ..MockBehavior::default()
    });
    let (sender, _) = spawn(&network);
    let (receiver, _) = spawn(&network);
    let mut sender_notices = sender.subscribe();

    connect(&sender, &receiver).await;
    network.fail_links();
    phase_reached(&mut sender_notices, Phase::Failed).await;

    sender.reconnect().await.unwrap();
    let snapshot = sender.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.attempt, None);

    network.set_behavior(MockBehavior::default());
    receiver.reconnect().await.unwrap();
    connect(&sender, &receiver).await;
    phase_reached(&mut sender_notices, Phase::Open).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failure_is_declared_on_the_configured_cadence() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::Never,
        ..MockBehavior::default()
    });
    let config = Config::default().with_watchdog_interval(Duration::from_millis(250));
    let (sender, _) = spawn_with(&network, config.clone());
    let (receiver, _) = spawn_with(&network, config);
    let mut receiver_notices = receiver.subscribe();

    connect(&sender, &receiver).await;
    let started = Instant::now();
    phase_reached(&mut receiver_notices, Phase::Failed).await;
    let elapsed = started.elapsed();
    assert!(elapsed > Duration::from_secs(15));
    assert!(elapsed <= Duration::from_millis(15_250));

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn send_gives_up_on_a_stalled_channel_within_the_retry_budget() {
    let network = MockNetwork::new(MockBehavior {
        channel_opening: ChannelOpening::Never,
        ..MockBehavior::default()
    });
    let policy = RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(100),
    };
    let (sender, _) = spawn_with(&network, Config::default().with_send_retry(policy));
    let (receiver, _) = spawn(&network);

    connect(&sender, &receiver).await;
    assert_eq!(sender.snapshot().await.unwrap().phase, Phase::Connecting);

    let started = Instant::now();
    let err = sender.send_credential("hunter2").await.unwrap_err();
    assert!(matches!(err, DriverError::Send(SendError::ChannelTimeout)));
    assert!(started.elapsed() <= policy.budget());

    sender.shutdown().await;
    receiver.shutdown().await;
}
