//! Replica runtime.
//!
//! The runtime owns one [`ReplicaState`], its [`Timers`] and the
//! [`TaskQueue`] everything else feeds. Each call to [`Runtime::run_once`]:
//!
//! 1. Moves expired timers onto the queue
//! 2. Drains the queue, one task at a time, through the state machine
//! 3. Applies the resulting timer commands and hands outbound frames to the
//!    [`Transport`]
//!
//! The runtime is neither re-entrant nor thread-safe. Producers on other
//! threads may share the queue, but only one thread may call `run_once`.

use std::io;
use std::time::Instant;

use bytes::Bytes;
use pbft_types::PrincipalId;

use crate::application::Application;
use crate::error::{Result, RuntimeError};
use crate::instrumentation::METRICS;
use crate::message::Message;
use crate::replica::{Destination, ReplicaEvent, ReplicaOutput, ReplicaState};
use crate::task::{Enqueued, Task, TaskQueue};
use crate::timer::Timers;

/// Sends encoded frames. Delivery is best-effort.
pub trait Transport {
    fn send(&mut self, destination: &Destination, bytes: Bytes) -> io::Result<()>;
}

/// Drives a replica from a task queue.
pub struct Runtime<T: Transport, A: Application> {
    /// Taken out for the duration of each transition.
    state: Option<ReplicaState<A>>,
    transport: T,
    tasks: TaskQueue,
    timers: Timers,
}

impl<T: Transport, A: Application> Runtime<T, A> {
    pub fn new(state: ReplicaState<A>, transport: T, queue_capacity: usize) -> Self {
        let timers = Timers::new(&state.config().timers);
        Self {
            state: Some(state),
            transport,
            tasks: TaskQueue::new(queue_capacity),
            timers,
        }
    }

    pub fn state(&self) -> Option<&ReplicaState<A>> {
        self.state.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    /// Earliest timer deadline, for sizing the transport's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Starts the replica: arms its timers and distributes session keys.
    pub fn start(&mut self, now: Instant, now_millis: u64) -> Result<()> {
        self.step(ReplicaEvent::Start { now_millis }, now)
    }

    /// Offers a task to the queue. Returns false, and counts the drop, if
    /// the queue is full.
    pub fn deliver(&self, task: Task) -> bool {
        match self.tasks.push(task) {
            Enqueued::Accepted => true,
            Enqueued::Full(task) => {
                tracing::debug!(?task, "task queue full, dropping");
                METRICS.increment_dropped_tasks();
                false
            }
        }
    }

    /// Offers a raw datagram to the queue.
    pub fn deliver_datagram(&self, bytes: Bytes, source: Option<PrincipalId>) -> bool {
        self.deliver(Task::Datagram { bytes, source })
    }

    /// Fires expired timers, then processes every queued task.
    ///
    /// Returns the number of tasks processed. Tasks produced while draining
    /// (none today) would be handled in the same call.
    pub fn run_once(&mut self, now: Instant, now_millis: u64) -> Result<usize> {
        for kind in self.timers.poll_expired(now) {
            self.deliver(Task::Timer(kind));
        }

        let mut processed = 0;
        while let Some(task) = self.tasks.pop() {
            processed += 1;
            self.handle(task, now, now_millis)?;
        }
        Ok(processed)
    }

    fn handle(&mut self, task: Task, now: Instant, now_millis: u64) -> Result<()> {
        match task {
            Task::ConnectionMade => {
                tracing::debug!("transport connected");
                Ok(())
            }
            Task::ConnectionLost => {
                tracing::error!("transport connection lost");
                Err(RuntimeError::TransportFatal)
            }
            Task::TransportError(error) => {
                tracing::warn!(%error, "transport error");
                Ok(())
            }
            Task::Timer(kind) => self.step(ReplicaEvent::Timeout { kind, now_millis }, now),
            Task::Datagram { bytes, source } => match Message::decode(&bytes) {
                Ok(message) => self.step(ReplicaEvent::Message { source, message }, now),
                Err(error) => {
                    tracing::debug!(?source, %error, "dropping undecodable datagram");
                    METRICS.increment_framing_errors();
                    Ok(())
                }
            },
        }
    }

    fn step(&mut self, event: ReplicaEvent, now: Instant) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        let (state, output) = state.process(event);
        self.state = Some(state);
        self.apply(output, now);
        Ok(())
    }

    fn apply(&mut self, output: ReplicaOutput, now: Instant) {
        for command in output.timers {
            self.timers.apply(command, now);
        }

        let mut sent = 0;
        for outbound in output.messages {
            let bytes = outbound.message.encode();
            match self.transport.send(&outbound.destination, bytes) {
                Ok(()) => sent += 1,
                Err(error) => {
                    tracing::warn!(destination = ?outbound.destination, %error, "send failed");
                }
            }
        }
        METRICS.add_messages_sent(sent);
    }
}

impl<T: Transport + std::fmt::Debug, A: Application> std::fmt::Debug for Runtime<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("replica", &self.state.as_ref().map(|s| s.replica_id()))
            .field("transport", &self.transport)
            .field("queued", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pbft_types::Digest;

    use super::*;
    use crate::config::{ClusterConfig, ReplicaConfig};
    use crate::message::MessagePayload;
    use crate::principal::testing::keyrings;
    use crate::timer::TimeoutKind;

    #[derive(Debug, Default)]
    struct Recorder {
        sent: Vec<(Destination, Bytes)>,
    }

    impl Transport for Recorder {
        fn send(&mut self, destination: &Destination, bytes: Bytes) -> io::Result<()> {
            self.sent.push((*destination, bytes));
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Echo;

    impl Application for Echo {
        fn execute(&mut self, _: PrincipalId, command: &[u8], _: &[u8]) -> Bytes {
            Bytes::copy_from_slice(command)
        }

        fn execute_read_only(&self, _: PrincipalId, _: &[u8]) -> Option<Bytes> {
            None
        }

        fn state_digest(&self) -> Digest {
            Digest::ZERO
        }
    }

    fn runtime(capacity: usize) -> Runtime<Recorder, Echo> {
        let keys = keyrings(4, 0).swap_remove(1);
        let state = ReplicaState::new(ReplicaConfig::new(ClusterConfig::new(1)), keys, Echo);
        Runtime::new(state, Recorder::default(), capacity)
    }

    #[test]
    fn start_sends_new_key_and_arms_timers() {
        let mut rt = runtime(8);
        let now = Instant::now();
        rt.start(now, 1_000).expect("start");

        let (destination, bytes) = &rt.transport().sent[0];
        assert_eq!(*destination, Destination::AllReplicas);
        let message = Message::decode(bytes).expect("decode");
        assert!(matches!(message.payload, MessagePayload::NewKey(_)));
        assert!(rt.next_deadline().is_some());
    }

    #[test]
    fn connection_lost_is_fatal() {
        let mut rt = runtime(8);
        assert!(rt.deliver(Task::ConnectionMade));
        assert!(rt.deliver(Task::ConnectionLost));
        let result = rt.run_once(Instant::now(), 0);
        assert!(matches!(result, Err(RuntimeError::TransportFatal)));
    }

    #[test]
    fn garbage_datagram_is_dropped() {
        let mut rt = runtime(8);
        assert!(rt.deliver_datagram(Bytes::from_static(b"\x00\x01"), None));
        assert!(rt.deliver(Task::TransportError("reset".into())));
        assert_eq!(rt.run_once(Instant::now(), 0).expect("run"), 2);
        assert!(rt.transport().sent.is_empty());
    }

    #[test]
    fn full_queue_drops_tasks() {
        let rt = runtime(1);
        assert!(rt.deliver(Task::ConnectionMade));
        assert!(!rt.deliver(Task::ConnectionMade));
        assert_eq!(rt.tasks().len(), 1);
    }

    #[test]
    fn expired_status_timer_broadcasts_status() {
        let mut rt = runtime(8);
        let now = Instant::now();
        rt.start(now, 0).expect("start");
        rt.transport_mut().sent.clear();

        let later = now + Duration::from_secs(1);
        rt.run_once(later, 1_000).expect("run");

        let statuses = rt
            .transport()
            .sent
            .iter()
            .filter_map(|(_, bytes)| Message::decode(bytes).ok())
            .filter(|m| matches!(m.payload, MessagePayload::Status(_)))
            .count();
        assert_eq!(statuses, 1);
        assert!(
            rt.timers.get(TimeoutKind::Status).is_armed(),
            "status timer rearms after firing"
        );
    }
}
