#![allow(dead_code)]

use std::time::Duration;

use driftline::model::{AlertRecord, AlertSeverity, DocumentRecord, MessageRecord};
use driftline::{Record, RecordId};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn message(id: RecordId, thread: &str, body: &str) -> Record {
    Record::Message(MessageRecord {
        id,
        thread_id: thread.into(),
        author: "ada".into(),
        body: body.into(),
        edited: false,
    })
}

pub fn document(id: RecordId, title: &str) -> Record {
    Record::Document(DocumentRecord {
        id,
        title: title.into(),
        body: "lorem".into(),
        revision: 1,
    })
}

pub fn alert(id: RecordId, text: &str) -> Record {
    Record::Alert(AlertRecord {
        id,
        severity: AlertSeverity::Warning,
        text: text.into(),
        acknowledged: false,
    })
}

/// Poll until `cond` holds, panicking after a generous deadline. Works under
/// both real and paused time.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn body_of(record: &Record) -> &str {
    match record {
        Record::Message(m) => &m.body,
        Record::Document(d) => &d.body,
        Record::Alert(a) => &a.text,
    }
}
