use std::sync::Mutex as StdMutex;

use shared::domain::PropertyState;

use super::*;
use crate::test_support::eventually;

#[test]
fn commands_expire_after_two_minutes() {
    let now = Utc::now();
    let fresh = RemoteCommand::new(RemoteCommandKind::EmergencyStop, now - Duration::seconds(119));
    let edge = RemoteCommand::new(RemoteCommandKind::EmergencyStop, now - Duration::seconds(120));
    let stale = RemoteCommand::new(RemoteCommandKind::EmergencyStop, now - Duration::seconds(121));
    assert!(fresh.is_fresh(now));
    assert!(edge.is_fresh(now));
    assert!(!stale.is_fresh(now));
}

#[test]
fn commands_from_the_far_future_are_not_fresh() {
    let now = Utc::now();
    let skewed = RemoteCommand::new(RemoteCommandKind::EmergencyStop, now + Duration::seconds(30));
    let future = RemoteCommand::new(RemoteCommandKind::EmergencyStop, now + Duration::seconds(121));
    let far = RemoteCommand::new(RemoteCommandKind::EmergencyStop, now + Duration::days(365));
    assert!(skewed.is_fresh(now));
    assert!(!future.is_fresh(now));
    assert!(!far.is_fresh(now));
}

#[test]
fn command_kinds_use_snake_case_on_the_wire() {
    let command = RemoteCommand::new(RemoteCommandKind::EnablePreviews, Utc::now());
    let value = serde_json::to_value(&command).expect("json");
    assert_eq!(value["kind"], "enable_previews");
    let back: RemoteCommand = serde_json::from_value(value).expect("decode");
    assert_eq!(back, command);
}

struct FlakyMirror {
    seen: StdMutex<Vec<String>>,
}

#[async_trait]
impl RemoteMirror for FlakyMirror {
    async fn publish(&self, key: &PropertyKey, record: &PropertyRecord) -> Result<()> {
        self.seen.lock().expect("lock").push(record.value.clone());
        if record.value == "bad" {
            anyhow::bail!("rejected {key}");
        }
        Ok(())
    }
}

#[tokio::test]
async fn queue_keeps_order_and_survives_publish_errors() {
    let mirror = Arc::new(FlakyMirror {
        seen: StdMutex::new(Vec::new()),
    });
    let queue = MirrorQueue::spawn(mirror.clone());
    let key = PropertyKey::new("Imager Agent", "AGENT_IMAGER_STATS", "FRAME").expect("key");
    for value in ["1", "bad", "3"] {
        queue.enqueue(key.clone(), PropertyRecord::new(value, PropertyState::Busy, None));
    }

    assert!(eventually(|| mirror.seen.lock().expect("lock").len() == 3).await);
    assert_eq!(*mirror.seen.lock().expect("lock"), vec!["1", "bad", "3"]);
}
