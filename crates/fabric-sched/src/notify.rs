//! Submission and notification contracts between scheduling components
//!
//! Both are fire-and-forget: a successful call only means the message was
//! queued at the receiver.

use std::fmt;
use tokio::sync::mpsc;

use crate::{Result, SchedError};
use fabric_hw::Request;

/// Accepts requests for execution
pub trait RequestSubmission: Send + Sync + fmt::Debug {
    /// Queue a request; its termination is not reported
    fn submit_request(&self, request: Request) -> Result<()>;

    /// Queue a request and report its termination to the submitter
    fn submit_request_and_notify(&self, request: Request) -> Result<()>;
}

/// Receives the requests whose execution finished
pub trait RequestNotificationSink: Send + Sync + fmt::Debug {
    /// Deliver a terminated request
    fn notify_request_termination(&self, request: Request) -> Result<()>;
}

impl RequestNotificationSink for mpsc::UnboundedSender<Request> {
    fn notify_request_termination(&self, request: Request) -> Result<()> {
        self.send(request).map_err(|e| {
            SchedError::Notification(format!("termination of {} not delivered", e.0.uri))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_and_reports_closure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.notify_request_termination(Request::new("r-1", 10))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().uri, "r-1");

        drop(rx);
        let err = tx
            .notify_request_termination(Request::new("r-2", 10))
            .unwrap_err();
        assert!(matches!(err, SchedError::Notification(m) if m.contains("r-2")));
    }
}
