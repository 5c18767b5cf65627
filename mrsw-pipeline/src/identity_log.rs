//! Per-identity log files
//!
//! [`IdentityLogLayer`] watches for the pipeline's identity span. When one
//! opens it appends to `raw/{sub}/{sub}_{ses}.log` and mirrors every event
//! recorded inside that span into the file, so one subject's history can be
//! read without the study-wide log.

use crate::layout::StudyLayout;
use mrsw_common::Identity;
use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Name of the span opened around one identity's stage chain
pub const IDENTITY_SPAN: &str = "identity";

const RULE_WIDTH: usize = 60;

/// Open log file stored in the identity span's extensions
struct IdentityLogFile(Mutex<File>);

impl IdentityLogFile {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.0.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Tracing layer writing each identity span's events to its own file
pub struct IdentityLogLayer {
    layout: StudyLayout,
}

impl IdentityLogLayer {
    pub fn new(layout: StudyLayout) -> Self {
        Self { layout }
    }

    fn open(&self, identity: &Identity) -> Option<IdentityLogFile> {
        // Missing subject directory: nothing to write into
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.identity_log_file(identity))
            .ok()?;
        Some(IdentityLogFile(Mutex::new(file)))
    }
}

#[derive(Default)]
struct IdentityFields {
    subject: Option<String>,
    session: Option<String>,
}

impl Visit for IdentityFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.store(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.store(field, format!("{:?}", value));
    }
}

impl IdentityFields {
    fn store(&mut self, field: &Field, value: String) {
        match field.name() {
            "subject" => self.subject = Some(value),
            "session" => self.session = Some(value),
            _ => {}
        }
    }

    fn identity(self) -> Option<Identity> {
        Identity::new(self.subject?, self.session?).ok()
    }
}

/// Message plus `key=value` pairs of one event
#[derive(Default)]
struct EventLine {
    message: String,
    fields: String,
}

impl Visit for EventLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

impl<S> Layer<S> for IdentityLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != IDENTITY_SPAN {
            return;
        }
        let mut fields = IdentityFields::default();
        attrs.record(&mut fields);

        let Some(identity) = fields.identity() else {
            return;
        };
        let Some(log) = self.open(&identity) else {
            return;
        };
        let Some(span) = ctx.span(id) else {
            return;
        };

        log.write_line("");
        log.write_line(&"-".repeat(RULE_WIDTH));
        log.write_line(&format!(
            "{} {} Base Dir : {}",
            identity.subject,
            identity.session,
            self.layout.root().display()
        ));
        span.extensions_mut().insert(log);
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        for span in scope {
            let extensions = span.extensions();
            let Some(log) = extensions.get::<IdentityLogFile>() else {
                continue;
            };

            let mut line = EventLine::default();
            event.record(&mut line);
            log.write_line(&format!(
                "{} {:>5} {}{}",
                timestamp(),
                event.metadata().level().as_str(),
                line.message,
                line.fields
            ));
            return;
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };
        if let Some(log) = span.extensions().get::<IdentityLogFile>() {
            log.write_line(&"-".repeat(RULE_WIDTH));
        };
    }
}
