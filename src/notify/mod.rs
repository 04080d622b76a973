//! Notification module: alert fan-out, webhook hand-off and the mail collaborator.

mod dispatcher;
mod mailer;
mod webhook;

pub use dispatcher::*;
pub use mailer::*;
pub use webhook::*;
