//! End-to-end scenarios from spec.md section 8, driven against
//! `moler_core::testing::FakeConnection` instead of a real transport.
//!
//! The parser catalog itself is out of scope for this crate (spec.md 1);
//! `PingParser` and `EchoParser` below are minimal fixtures satisfying
//! `CommandParser`, existing only to exercise the core's observer
//! contract the way a real ping/echo parser from the catalog would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;

use moler_core::device::{Device, NOT_CONNECTED};
use moler_core::error::Error;
use moler_core::fanout::{Chunk, FanoutConnection};
use moler_core::observer::command::{Command, CommandParser, ParseOutcome};
use moler_core::observer::event::{Event, Match, RegexMatcher};
use moler_core::observer::ObserverHandle;
use moler_core::scheduler::Scheduler;
use moler_core::testing::FakeConnection;

#[derive(Debug, Clone, PartialEq)]
struct PingResult {
    packets_transmitted: u32,
    packets_received: u32,
    packet_loss: u32,
    time_unit: String,
}

struct PingParser {
    destination: String,
    options: String,
    buffer: String,
}

impl PingParser {
    fn new(destination: &str, options: &str) -> Self {
        PingParser {
            destination: destination.to_string(),
            options: options.to_string(),
            buffer: String::new(),
        }
    }
}

impl CommandParser for PingParser {
    type Output = PingResult;

    fn command_string(&self) -> String {
        format!("ping {} {}", self.options, self.destination)
    }

    fn feed(&mut self, chunk: &Chunk, expected_prompt: &Regex) -> ParseOutcome<PingResult> {
        self.buffer.push_str(&chunk.text);
        if !expected_prompt.is_match(&self.buffer) {
            return ParseOutcome::Pending;
        }
        let summary = Regex::new(r"(\d+) packets transmitted, (\d+) packets received, (\d+)% packet loss")
            .expect("static regex always compiles");
        match summary.captures(&self.buffer) {
            Some(caps) => ParseOutcome::Complete(PingResult {
                packets_transmitted: caps[1].parse().unwrap_or_default(),
                packets_received: caps[2].parse().unwrap_or_default(),
                packet_loss: caps[3].parse().unwrap_or_default(),
                time_unit: "ms".to_string(),
            }),
            None => ParseOutcome::Failed(Error::ParsingFailure {
                details: "no ping summary line in output".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct EchoParser {
    buffer: String,
}

impl CommandParser for EchoParser {
    type Output = String;

    fn command_string(&self) -> String {
        "echo hi".to_string()
    }

    fn feed(&mut self, chunk: &Chunk, expected_prompt: &Regex) -> ParseOutcome<String> {
        self.buffer.push_str(&chunk.text);
        if expected_prompt.is_match(&self.buffer) {
            ParseOutcome::Complete(self.buffer.clone())
        } else {
            ParseOutcome::Pending
        }
    }
}

fn prompt() -> Regex {
    Regex::new(r"moler_bash#").expect("static regex always compiles")
}

#[tokio::test]
async fn synchronous_ping_round_trip() {
    let (fake, handle) = FakeConnection::new("ping-dev");
    let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "ping-dev"));
    let scheduler = Scheduler::new("ping-dev");

    let cmd = Command::new(
        PingParser::new("www.example.com", "-w 1"),
        fanout,
        scheduler,
        prompt(),
    );

    let feeder_handle = handle;
    let feeder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        feeder_handle
            .feed(
                "PING www.example.com (93.184.216.34): 56 data bytes\n\
                 64 bytes from 93.184.216.34: icmp_seq=0 ttl=55 time=11.632 ms\n\
                 \n\
                 --- www.example.com ping statistics ---\n\
                 1 packets transmitted, 1 packets received, 0% packet loss\n\
                 round-trip min/avg/max/stddev = 11.632/11.632/11.632/0.000 ms\n\
                 moler_bash# "
                    .to_string(),
            )
            .await;
    });

    let result = cmd.call(Duration::from_secs(2)).await.expect("ping should succeed");
    feeder.await.expect("feeder task should not panic");

    assert_eq!(result.packets_transmitted, 1);
    assert_eq!(result.packets_received, 1);
    assert_eq!(result.packet_loss, 0);
    assert_eq!(result.time_unit, "ms");
}

#[tokio::test]
async fn background_command_then_await() {
    let (fake, handle) = FakeConnection::new("dev");
    let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "dev"));
    let scheduler = Scheduler::new("dev");

    let cmd = Command::new(EchoParser::default(), fanout, scheduler, prompt());

    cmd.start(Duration::from_secs(2)).await.expect("start should succeed");
    assert!(!cmd.done());

    handle.feed("hi\nmoler_bash# ".to_string()).await;
    // Give the fan-out's distributor a tick to deliver the chunk.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let began_waiting = tokio::time::Instant::now();
    cmd.await_done(Duration::from_secs(2)).await.expect("command should complete");
    assert!(began_waiting.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn command_times_out_when_connection_stays_silent() {
    let (fake, _handle) = FakeConnection::new("dev");
    let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "dev"));
    let scheduler = Scheduler::new("dev");

    let cmd = Command::new(EchoParser::default(), fanout, scheduler, prompt());
    cmd.start(Duration::from_millis(200)).await.expect("start should succeed");

    let err = cmd
        .await_done(Duration::from_millis(500))
        .await
        .expect_err("silent connection should time out");

    match err {
        Error::Timeout { elapsed, .. } => {
            assert!(elapsed >= Duration::from_millis(200));
            assert!(elapsed <= Duration::from_millis(300));
        }
        other => panic!("expected Error::Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn event_and_command_both_observe_one_connection() {
    let (fake, handle) = FakeConnection::new("dev");
    let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "dev"));
    let scheduler = Scheduler::new("dev");

    let alarm = Event::new(
        RegexMatcher::new(Regex::new("ALARM").unwrap()),
        fanout.clone(),
        scheduler.clone(),
        Some(1),
    );
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    alarm.subscribe_matches(move |m: &Match| {
        seen_clone.lock().unwrap().push(m.text.to_string());
    });
    alarm.start(Duration::from_secs(2)).await.expect("event should start");

    let cmd = Command::new(EchoParser::default(), fanout, scheduler, prompt());
    cmd.start(Duration::from_secs(2)).await.expect("command should start");

    handle.feed("ALARM\nhi\nmoler_bash# ".to_string()).await;

    alarm.await_done(Duration::from_secs(1)).await.expect("event should fire once and complete");
    cmd.await_done(Duration::from_secs(1)).await.expect("command should complete");

    assert_eq!(seen.lock().unwrap().as_slice(), ["ALARM".to_string()]);
}

fn immediate_ok_factory() -> moler_core::device::CommandFactory {
    Arc::new(|connection, scheduler, _params| {
        Command::new(EchoParser::default(), connection, scheduler, prompt())
            as Arc<dyn ObserverHandle>
    })
}

#[tokio::test]
async fn device_state_transition_reaches_unix_remote() {
    let (fake, handle) = FakeConnection::new("dev");
    let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "dev"));
    let scheduler = Scheduler::new("dev");

    let device = Device::builder("dev", fanout, scheduler, "UNIX_LOCAL")
        .hop(
            "UNIX_LOCAL",
            "UNIX_REMOTE",
            "ssh",
            HashMap::new(),
            "remote#",
            Some("exit".to_string()),
        )
        .command("UNIX_LOCAL", "ssh", immediate_ok_factory())
        .command("UNIX_REMOTE", "exit", immediate_ok_factory())
        .command("UNIX_REMOTE", "ls", immediate_ok_factory())
        .build();

    tokio::spawn(async move {
        // The command fixture completes on any text containing the
        // prompt, so feeding just the prompt is enough to unblock each hop.
        loop {
            handle.feed("moler_bash# ".to_string()).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    device
        .goto_state("UNIX_REMOTE", Duration::from_secs(2))
        .await
        .expect("goto_state should succeed");
    assert_eq!(device.current_state(), "UNIX_REMOTE");

    let ls = device.get_cmd("ls", HashMap::new()).expect("ls should be registered for UNIX_REMOTE");
    assert!(ls.id() > 0);
}

#[tokio::test]
async fn connection_loss_moves_device_to_not_connected() {
    let (fake, handle) = FakeConnection::new("dev");
    let handle = Arc::new(handle);
    let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "dev"));
    let scheduler = Scheduler::new("dev");

    let device = Device::builder("dev", fanout, scheduler, NOT_CONNECTED)
        .hop(NOT_CONNECTED, "UNIX_LOCAL", "open", HashMap::new(), "#", None)
        .command(NOT_CONNECTED, "open", immediate_ok_factory())
        .command("UNIX_LOCAL", "long_running", immediate_ok_factory())
        .build();

    let keep_feeding = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let opening_feeder = handle.clone();
    let keep_feeding_clone = keep_feeding.clone();
    let feeder_task = tokio::spawn(async move {
        while keep_feeding_clone.load(std::sync::atomic::Ordering::Acquire) {
            opening_feeder.feed("moler_bash# ".to_string()).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    device
        .goto_state("UNIX_LOCAL", Duration::from_secs(1))
        .await
        .expect("initial hop should succeed");
    // Stop feeding prompts: the next command must only see connection loss,
    // not a stray prompt completing it first.
    keep_feeding.store(false, std::sync::atomic::Ordering::Release);
    feeder_task.await.expect("feeder task should not panic");

    let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let reasons_clone = reasons.clone();
    device.add_state_change_subscriber(move |sc| {
        reasons_clone.lock().unwrap().push(sc.reason.clone());
    });

    let cmd = device
        .get_cmd("long_running", HashMap::new())
        .expect("long_running should be registered for UNIX_LOCAL");
    cmd.start(Duration::from_secs(5)).await.expect("command should start");

    handle.drop_transport();

    let err = cmd
        .await_done(Duration::from_secs(1))
        .await
        .expect_err("command should observe connection loss");
    assert!(matches!(err, Error::ConnectionLost));

    // The device's own connection watcher reacts asynchronously to the
    // same notification; give it a moment to run.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(device.current_state(), NOT_CONNECTED);
    assert!(reasons.lock().unwrap().contains(&"connection_lost".to_string()));
}
