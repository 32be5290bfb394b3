use hotflow::{
    HotStream, HotStreamConfig, HotflowError, OverflowPolicy, Publisher, PublisherConfig, Scheduler, StreamError,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn drain_now<T: Clone>(sub: &mut hotflow::Subscriber<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(v) = sub.try_next().unwrap() {
        out.push(v);
    }
    out
}

#[test]
fn replay_reaches_subscriber_attached_after_publish() {
    let stream = HotStream::new(HotStreamConfig::new(1, 0, OverflowPolicy::Suspend)).unwrap();
    assert_eq!(stream.subscriber_count(), 0);

    assert!(stream.try_publish("A").unwrap());
    assert!(stream.try_publish("B").unwrap());

    let mut late = stream.subscribe();
    assert_eq!(late.try_next().unwrap(), Some("B"));
    assert_eq!(late.try_next().unwrap(), None);
}

#[test]
fn without_replay_late_subscriber_sees_only_later_values() {
    let mut scheduler = Scheduler::new();
    let handle = scheduler.handle();
    let stream = HotStream::new(HotStreamConfig::default()).unwrap();

    // No subscribers: produced and discarded.
    assert!(stream.try_publish("A").unwrap());

    let mut late = stream.subscribe();
    assert_eq!(late.try_next().unwrap(), None);

    let reader = handle.spawn(async move { late.next().await });
    scheduler
        .block_on(async {
            handle.sleep(10).await;
            stream.publish("B").await
        })
        .unwrap()
        .unwrap();

    assert_eq!(scheduler.block_on(reader).unwrap().unwrap(), "B");
}

#[test]
fn each_subscriber_reads_in_publish_order() {
    let stream = HotStream::new(HotStreamConfig::new(0, 8, OverflowPolicy::Suspend)).unwrap();
    let mut a = stream.subscribe();
    let mut b = stream.subscribe();

    for i in 1..=5 {
        assert!(stream.try_publish(i).unwrap());
    }

    assert_eq!(drain_now(&mut a), vec![1, 2, 3, 4, 5]);
    assert_eq!(drain_now(&mut b), vec![1, 2, 3, 4, 5]);
}

#[test]
fn drop_oldest_keeps_the_newest_values() {
    let stream = HotStream::new(HotStreamConfig::new(0, 2, OverflowPolicy::DropOldest)).unwrap();
    let mut sub = stream.subscribe();

    for i in 1..=5 {
        assert!(stream.try_publish(i).unwrap());
    }

    assert_eq!(drain_now(&mut sub), vec![4, 5]);
    let stats = stream.stats();
    assert_eq!(stats.published, 5);
    assert_eq!(stats.dropped_oldest, 3);
}

#[test]
fn drop_latest_keeps_the_buffered_values() {
    let stream = HotStream::new(HotStreamConfig::new(0, 2, OverflowPolicy::DropLatest)).unwrap();
    let mut sub = stream.subscribe();

    for i in 1..=5 {
        stream.try_publish(i).unwrap();
    }

    assert_eq!(drain_now(&mut sub), vec![1, 2]);
    assert_eq!(stream.stats().dropped_latest, 3);
}

#[test]
fn drop_latest_still_updates_the_replay_slot() {
    let stream = HotStream::new(HotStreamConfig::new(1, 1, OverflowPolicy::DropLatest)).unwrap();
    let mut early = stream.subscribe();

    for i in 1..=3 {
        stream.try_publish(i).unwrap();
    }

    assert_eq!(drain_now(&mut early), vec![1, 2]);
    assert_eq!(stream.value(), Some(3));
    let mut late = stream.subscribe();
    assert_eq!(late.try_next().unwrap(), Some(3));
}

#[test]
fn drops_apply_per_subscriber() {
    let stream = HotStream::new(HotStreamConfig::new(0, 1, OverflowPolicy::DropOldest)).unwrap();
    let mut fast = stream.subscribe();
    let mut slow = stream.subscribe();

    stream.try_publish("A").unwrap();
    assert_eq!(fast.try_next().unwrap(), Some("A"));
    stream.try_publish("B").unwrap();

    assert_eq!(drain_now(&mut fast), vec!["B"]);
    assert_eq!(drain_now(&mut slow), vec!["B"]);
    assert_eq!(stream.stats().dropped_oldest, 1);
}

#[test]
fn suspend_waits_for_slow_subscriber_and_loses_nothing() {
    init_tracing();
    let mut scheduler = Scheduler::new();
    let handle = scheduler.handle();
    let stream = HotStream::new(HotStreamConfig::default()).unwrap();
    let view = stream.share();
    let mut sub = stream.subscribe();

    let h = handle.clone();
    let reader = handle.spawn(async move {
        let mut seen = Vec::new();
        loop {
            h.sleep(250).await;
            match sub.next().await {
                Ok(v) => seen.push((v, h.now())),
                Err(err) if err.is_terminal() => return Ok(seen),
                Err(err) => return Err(err),
            }
        }
    });

    let publisher = Publisher::new(stream, handle, PublisherConfig::default());
    let report = scheduler.block_on(publisher.run(1..=4)).unwrap().unwrap();

    assert_eq!(report.published, 4);
    assert_eq!(report.elapsed_ticks, 1000);
    let seen = scheduler.block_on(reader).unwrap().unwrap();
    assert_eq!(seen, vec![(1, 250), (2, 500), (3, 750), (4, 1000)]);
    assert_eq!(view.stats().suspensions, 4);
}

#[test]
fn suspend_waits_for_the_slowest_subscriber() {
    init_tracing();
    let mut scheduler = Scheduler::new();
    let handle = scheduler.handle();
    let stream = HotStream::new(HotStreamConfig::default()).unwrap();
    let mut fast = stream.subscribe();
    let mut slow = stream.subscribe();

    let h = handle.clone();
    let fast_reader = handle.spawn(async move {
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push((fast.next().await.unwrap(), h.now()));
        }
        seen
    });
    let h = handle.clone();
    let slow_reader = handle.spawn(async move {
        let mut seen = Vec::new();
        for _ in 0..3 {
            h.sleep(100).await;
            seen.push((slow.next().await.unwrap(), h.now()));
        }
        seen
    });

    let h = handle.clone();
    let published_at = scheduler
        .block_on(async {
            let mut at = Vec::new();
            for v in 1..=3u32 {
                stream.publish(v).await.unwrap();
                at.push(h.now());
            }
            at
        })
        .unwrap();

    // The fast reader never gets ahead of the slow one.
    assert_eq!(published_at, [100, 200, 300]);
    assert_eq!(scheduler.block_on(fast_reader).unwrap(), [(1, 100), (2, 200), (3, 300)]);
    assert_eq!(scheduler.block_on(slow_reader).unwrap(), [(1, 100), (2, 200), (3, 300)]);
    let stats = stream.stats();
    assert_eq!(stats.suspensions, 3);
    assert_eq!(stats.delivered, 6);
}

#[test]
fn subscriber_attached_during_suspended_publish_misses_that_value() {
    let mut scheduler = Scheduler::new();
    let stream = HotStream::new(HotStreamConfig::new(0, 1, OverflowPolicy::Suspend)).unwrap();
    let mut early = stream.subscribe();
    assert!(stream.try_publish(1).unwrap());

    scheduler
        .block_on(async {
            let mut publish = Box::pin(stream.publish(2));
            assert!(futures::poll!(publish.as_mut()).is_pending());

            let mut late = stream.subscribe();
            assert_eq!(early.try_next().unwrap(), Some(1));
            publish.await.unwrap();

            assert_eq!(late.try_next().unwrap(), None);
            assert_eq!(early.try_next().unwrap(), Some(2));

            assert!(stream.try_publish(3).unwrap());
            assert_eq!(late.try_next().unwrap(), Some(3));
            assert_eq!(early.try_next().unwrap(), Some(3));
        })
        .unwrap();
}

#[test]
fn try_publish_rejects_whole_value_when_suspend_has_no_room() {
    let stream = HotStream::new(HotStreamConfig::new(1, 0, OverflowPolicy::Suspend)).unwrap();
    let mut sub = stream.subscribe();

    assert!(stream.try_publish("A").unwrap());
    assert!(!stream.try_publish("B").unwrap());

    assert_eq!(stream.value(), Some("A"));
    assert_eq!(stream.stats().rejected, 1);
    assert_eq!(drain_now(&mut sub), vec!["A"]);
}

#[test]
fn close_keeps_pending_values_and_rejects_publishes() {
    let mut scheduler = Scheduler::new();
    let stream = HotStream::new(HotStreamConfig::new(0, 4, OverflowPolicy::Suspend)).unwrap();
    let mut sub = stream.subscribe();

    stream.try_publish(1).unwrap();
    stream.close();
    assert!(stream.is_closed());

    assert_eq!(sub.try_next().unwrap(), Some(1));
    let err = sub.try_next().unwrap_err();
    assert!(err.is_terminal());

    let err = stream.try_publish(2).unwrap_err();
    assert!(matches!(err, HotflowError::Stream(StreamError::PublishAfterClose)));
    let err = scheduler.block_on(stream.publish(3)).unwrap().unwrap_err();
    assert!(matches!(err, HotflowError::Stream(StreamError::PublishAfterClose)));
}

#[test]
fn close_releases_suspended_publisher_and_parked_reader() {
    let mut scheduler = Scheduler::new();
    let handle = scheduler.handle();
    let stream = HotStream::new(HotStreamConfig::default()).unwrap();
    let _idle = stream.subscribe();
    let mut parked = stream.subscribe();
    let reader = handle.spawn(async move { parked.next().await });

    let h = handle.clone();
    let published = scheduler
        .block_on(async {
            let (published, ()) = futures::join!(stream.publish(7u32), async {
                h.sleep(50).await;
                stream.close();
            });
            published
        })
        .unwrap();

    assert!(matches!(published, Err(HotflowError::Stream(StreamError::PublishAfterClose))));
    assert!(scheduler.block_on(reader).unwrap().unwrap_err().is_terminal());
    assert_eq!(scheduler.now(), 50);
}

#[test]
fn state_stream_serves_last_value_to_late_subscribers() {
    let mut scheduler = Scheduler::new();
    let handle = scheduler.handle();
    let stream = HotStream::new(HotStreamConfig::default()).unwrap();
    let state = HotStream::with_initial(HotStreamConfig::state(), "-").unwrap();
    let mut early = state.subscribe();

    let publisher = Publisher::new(stream, handle, PublisherConfig::default()).mirror_to(state);
    let mirror = publisher.mirror().unwrap();
    scheduler.block_on(publisher.run(["A", "B", "C"])).unwrap().unwrap();

    // A state stream conflates: the early subscriber only holds the newest value.
    assert_eq!(drain_now(&mut early), vec!["C"]);
    let mut late = mirror.subscribe();
    assert_eq!(late.try_next().unwrap(), Some("C"));
}

#[test]
fn initial_value_requires_replay() {
    let err = HotStream::with_initial(HotStreamConfig::default(), 0).unwrap_err();
    assert!(matches!(err, hotflow::ValidationError::InitialValueWithoutReplay));

    let err = HotStream::<u8>::new(HotStreamConfig::new(0, 0, OverflowPolicy::DropOldest)).unwrap_err();
    assert!(matches!(err, hotflow::ValidationError::DropPolicyWithoutBuffer { .. }));
}
