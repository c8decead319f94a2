use ato_bridge::event_bus::EventBus;
use ato_bridge::protocol::{TaskEvent, TaskEventKind};
use uuid::Uuid;

fn event(kind: TaskEventKind) -> TaskEvent {
    TaskEvent::new(kind, Uuid::new_v4())
}

#[test]
fn publish_without_subscribers_is_a_no_op() {
    let bus = EventBus::new();
    bus.publish(event(TaskEventKind::TaskCreated));
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn publish_delivers_to_every_subscriber() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();

    bus.publish(event(TaskEventKind::PlanReady));

    assert_eq!(rx1.try_recv().unwrap().kind, TaskEventKind::PlanReady);
    assert_eq!(rx2.try_recv().unwrap().kind, TaskEventKind::PlanReady);
}

#[test]
fn dropped_receiver_is_pruned() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    drop(rx1);

    bus.publish(event(TaskEventKind::TaskLog));

    assert_eq!(bus.subscriber_count(), 1);
    assert!(rx2.try_recv().is_ok());
}

#[test]
fn events_arrive_in_publish_order() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    bus.publish(event(TaskEventKind::StepStarted));
    bus.publish(event(TaskEventKind::StepAction));
    bus.publish(event(TaskEventKind::StepCompleted));

    let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TaskEventKind::StepStarted,
            TaskEventKind::StepAction,
            TaskEventKind::StepCompleted
        ]
    );
}

#[test]
fn late_subscriber_misses_earlier_events() {
    let bus = EventBus::new();
    bus.publish(event(TaskEventKind::TaskCreated));
    let rx = bus.subscribe();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unread_subscriber_never_blocks_publisher() {
    let bus = EventBus::new();
    let _idle = bus.subscribe();
    for _ in 0..10_000 {
        bus.publish(event(TaskEventKind::TestCommandOutput));
    }
    assert_eq!(bus.subscriber_count(), 1);
}
