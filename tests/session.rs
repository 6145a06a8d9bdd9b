use std::{thread, time::Duration};

use periphlink::{
    codec::{Telemetry, Value},
    command::{CommandRequest, CommandStatus, DeviceFault, Opcode},
    connection::ConnectionState,
    error::Error,
    session::{BusyPolicy, CancelOutcome, Session, SessionConfig, SessionPhase},
    Recovery,
};
use pretty_assertions::assert_eq;
use serialport::{DataBits, StopBits};

mod common;

use common::{LineEvent, MockDevice};

fn fast_config() -> SessionConfig {
    SessionConfig {
        response_timeout_ms: 100,
        ..SessionConfig::default()
    }
}

fn clear() -> CommandRequest {
    CommandRequest::new(Opcode::ScreenClear, vec![])
}

#[test]
fn ch340_lines_are_configured_before_the_first_command() {
    let device = MockDevice::acking();
    let session = Session::new(device.connect(), fast_config()).unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    let result = session
        .submit(CommandRequest::new(Opcode::ScreenInit, vec![]))
        .unwrap();
    assert_eq!(result.status, CommandStatus::Ok(None));

    let events = device.state().events.clone();
    assert_eq!(
        events,
        vec![
            LineEvent::Opened,
            LineEvent::Baud(115_200),
            LineEvent::DataBits(DataBits::Eight),
            LineEvent::StopBits(StopBits::One),
            LineEvent::FlowControl(false),
            LineEvent::Dtr(false),
            LineEvent::Rts(false),
            LineEvent::Command("screenInit".into()),
        ]
    );
}

#[test]
fn results_arrive_in_acceptance_order() {
    let device = MockDevice::new(|request| {
        Some(CommandStatus::Ok(Some(Value::Int(request.correlation_id as i32))))
    });
    let session = Session::new(device.connect(), fast_config()).unwrap();

    let pending = (0..10)
        .map(|_| session.enqueue(clear()).unwrap())
        .collect::<Vec<_>>();
    let ids = pending
        .iter()
        .map(|pending| pending.correlation_id())
        .collect::<Vec<_>>();

    let results = pending
        .into_iter()
        .map(|pending| pending.wait().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(results.len(), 10);
    for (result, id) in results.iter().zip(&ids) {
        assert_eq!(result.correlation_id, *id);
        assert_eq!(result.status, CommandStatus::Ok(Some(Value::Int(*id as i32))));
    }
    assert_eq!(device.state().requests.len(), 10);
}

#[test]
fn single_timeout_keeps_the_connection() {
    let device = MockDevice::new(|request| match request.opcode {
        Opcode::ConsoleFps => None,
        _ => Some(CommandStatus::Ok(None)),
    });
    let session = Session::new(device.connect(), fast_config()).unwrap();

    let result = session
        .submit(CommandRequest::new(Opcode::ConsoleFps, vec![]))
        .unwrap();
    assert_eq!(result.status, CommandStatus::TimedOut);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.consecutive_timeouts(), 1);

    let err = result.into_result().unwrap_err();
    assert_eq!(err.recovery(), Recovery::Retry);

    // A success resets the count
    assert!(session.submit(clear()).unwrap().is_ok());
    assert_eq!(session.consecutive_timeouts(), 0);
}

#[test]
fn repeated_timeouts_fault_the_connection() {
    let device = MockDevice::new(|_| None);
    let session = Session::new(device.connect(), fast_config()).unwrap();

    for n in 1..=3 {
        let result = session.submit(clear()).unwrap();
        assert_eq!(result.status, CommandStatus::TimedOut);
        assert_eq!(session.consecutive_timeouts(), n);
    }

    assert_eq!(session.state(), ConnectionState::Faulted);

    let err = session.submit(clear()).unwrap_err();
    assert!(matches!(err, Error::DeviceUnresponsive(3)));
    assert_eq!(err.recovery(), Recovery::Reconnect);
    assert_eq!(device.state().requests.len(), 3);
}

#[test]
fn queued_commands_drain_when_the_connection_faults() {
    let config = SessionConfig {
        max_consecutive_timeouts: 1,
        ..fast_config()
    };
    let device = MockDevice::new(|_| None);
    let session = Session::new(device.connect(), config).unwrap();

    let first = session.enqueue(clear()).unwrap();
    let second = session.enqueue(clear()).unwrap();

    assert_eq!(first.wait().unwrap().status, CommandStatus::TimedOut);
    assert_eq!(
        second.wait().unwrap().status,
        CommandStatus::DeviceError(DeviceFault::Unresponsive)
    );
    assert_eq!(device.state().requests.len(), 1);
}

#[test]
fn reopen_clears_a_fault() {
    let config = SessionConfig {
        max_consecutive_timeouts: 1,
        ..fast_config()
    };
    let device = MockDevice::new(|request| match request.opcode {
        Opcode::ConsoleFps => None,
        _ => Some(CommandStatus::Ok(None)),
    });
    let session = Session::new(device.connect(), config).unwrap();

    session
        .submit(CommandRequest::new(Opcode::ConsoleFps, vec![]))
        .unwrap();
    assert_eq!(session.state(), ConnectionState::Faulted);

    session.reopen().unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.consecutive_timeouts(), 0);
    assert!(session.submit(clear()).unwrap().is_ok());

    let opens = device
        .state()
        .events
        .iter()
        .filter(|event| **event == LineEvent::Opened)
        .count();
    assert_eq!(opens, 2);
}

#[test]
fn cancelling_a_queued_command() {
    let device = MockDevice::new(|request| match request.opcode {
        Opcode::ConsoleFps => None,
        _ => Some(CommandStatus::Ok(None)),
    });
    let session = Session::new(device.connect(), fast_config()).unwrap();

    // Keeps the worker busy while the second command waits in the queue
    let slow = session
        .enqueue(CommandRequest::new(Opcode::ConsoleFps, vec![]))
        .unwrap();
    let mut queued = session.enqueue(clear()).unwrap();

    assert_eq!(queued.cancel(), CancelOutcome::Dequeued);
    assert!(matches!(queued.wait(), Err(Error::Cancelled)));

    assert_eq!(slow.wait().unwrap().status, CommandStatus::TimedOut);
    assert_eq!(device.state().commands(), vec!["consoleFps"]);
}

#[test]
fn cancelling_an_in_flight_command() {
    let device = MockDevice::new(|_| None);
    let session = Session::new(
        device.connect(),
        SessionConfig {
            response_timeout_ms: 5_000,
            ..SessionConfig::default()
        },
    )
    .unwrap();

    let mut pending = session.enqueue(clear()).unwrap();
    while session.phase() != SessionPhase::AwaitingResponse {
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(pending.cancel(), CancelOutcome::AbortRequested);
    assert!(matches!(pending.wait(), Err(Error::Cancelled)));

    // The abort is not a timeout and the session remains usable
    assert_eq!(session.consecutive_timeouts(), 0);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[test]
fn reject_policy_refuses_work_while_busy() {
    let device = MockDevice::new(|request| match request.opcode {
        Opcode::ConsoleFps => None,
        _ => Some(CommandStatus::Ok(None)),
    });
    let config = SessionConfig {
        busy_policy: BusyPolicy::Reject,
        ..fast_config()
    };
    let session = Session::new(device.connect(), config).unwrap();

    let slow = session
        .enqueue(CommandRequest::new(Opcode::ConsoleFps, vec![]))
        .unwrap();

    let err = session.enqueue(clear()).unwrap_err();
    assert!(matches!(err, Error::Busy));
    assert_eq!(err.recovery(), Recovery::Retry);

    slow.wait().unwrap();
    assert!(session.submit(clear()).unwrap().is_ok());
}

#[test]
fn invalid_requests_are_refused_before_sending() {
    let device = MockDevice::acking();
    let session = Session::new(device.connect(), fast_config()).unwrap();

    let err = session
        .submit(CommandRequest::new(Opcode::ScreenRotate, vec![]))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArguments { .. }));
    assert!(device.state().requests.is_empty());
}

#[test]
fn device_errors_are_reported() {
    let device = MockDevice::new(|_| Some(CommandStatus::DeviceError(DeviceFault::Code(7))));
    let session = Session::new(device.connect(), fast_config()).unwrap();

    let result = session.submit(clear()).unwrap();
    assert_eq!(result.status, CommandStatus::DeviceError(DeviceFault::Code(7)));
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[test]
fn write_failures_fault_the_connection() {
    let device = MockDevice::acking();
    let session = Session::new(device.connect(), fast_config()).unwrap();

    device.state().broken = true;

    let result = session.submit(clear()).unwrap();
    assert_eq!(
        result.status,
        CommandStatus::DeviceError(DeviceFault::ConnectionLost)
    );
    assert_eq!(session.state(), ConnectionState::Faulted);
    assert!(matches!(session.submit(clear()), Err(Error::Connection(_))));
}

#[test]
fn telemetry_is_buffered() {
    let device = MockDevice::acking();
    let session = Session::new(device.connect(), fast_config()).unwrap();

    device.emit(Telemetry {
        channel: 1,
        value: Some(Value::Int(30)),
    });
    device.emit(Telemetry {
        channel: 2,
        value: None,
    });

    // Telemetry interleaved with a response is kept as well
    assert!(session.submit(clear()).unwrap().is_ok());

    let mut events = Vec::new();
    for _ in 0..100 {
        events.extend(session.drain_telemetry());
        if events.len() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(
        events,
        vec![
            Telemetry {
                channel: 1,
                value: Some(Value::Int(30)),
            },
            Telemetry {
                channel: 2,
                value: None,
            },
        ]
    );
}

#[test]
fn closing_resolves_pending_work() {
    let device = MockDevice::new(|_| None);
    let mut session = Session::new(
        device.connect(),
        SessionConfig {
            response_timeout_ms: 5_000,
            ..SessionConfig::default()
        },
    )
    .unwrap();

    let in_flight = session.enqueue(clear()).unwrap();
    let queued = session.enqueue(clear()).unwrap();

    session.close();

    assert_eq!(
        in_flight.wait().unwrap().status,
        CommandStatus::DeviceError(DeviceFault::ConnectionLost)
    );
    assert!(matches!(
        queued.wait().map(|result| result.status),
        Ok(CommandStatus::DeviceError(DeviceFault::ConnectionLost)) | Err(Error::SessionClosed)
    ));
    assert_eq!(session.phase(), SessionPhase::Closed);
    assert!(matches!(session.submit(clear()), Err(Error::SessionClosed)));
}

#[test]
fn sessions_refuse_a_zero_timeout_threshold() {
    let device = MockDevice::acking();
    let config = SessionConfig {
        max_consecutive_timeouts: 0,
        ..fast_config()
    };

    assert!(matches!(
        Session::new(device.connect(), config),
        Err(Error::InvalidSessionConfig(_))
    ));
}
