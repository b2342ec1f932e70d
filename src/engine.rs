//! Handshake state machine and transaction engine.
//!
//! Every bus transaction runs the same MRDY/SRDY level sequence:
//!
//! ```text
//!         host                      device
//! IDLE ──► MRDY low  ─────────────► (prepares)
//!          wait SRDY low ◄───────── SRDY low
//!          transfer frame ────────► (consumes / replies)
//!          [wait SRDY high, read]◄─ SRDY high
//! IDLE ◄── MRDY high
//! ```
//!
//! Both SRDY waits are bounded. A freshly reset device holds SRDY high far
//! longer than the bound, so an expired wait is reported as
//! [`NpiError::PossibleReset`] rather than a generic timeout - the caller
//! can tell "device is slow" from "device reset and needs
//! resynchronization".
//!
//! Responses are read as a 3-byte dummy exchange first, establishing the
//! true response length, then exactly `length` more bytes are clocked. The
//! length byte is taken at face value; the framing carries no checksum and
//! none is added here, to stay wire-compatible.
//!
//! The caller is responsible for holding the transaction lock across each
//! of these functions; they receive the hardware by exclusive reference and
//! never touch the lock themselves.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{NpiError, Result};
use crate::hardware::{Hardware, Level, WaitOutcome};
use crate::protocol::{CommandType, Frame, Header, HEADER_SIZE, MAX_PAYLOAD};
use crate::session::SessionConfig;

/// Synchronous request/response exchange, in place in `frame`.
///
/// Tags the frame as a synchronous request, runs the send half of the
/// handshake, waits for the device's response within the same MRDY
/// assertion window, and replaces the frame's contents with the response,
/// retagged as [`CommandType::SyncResponse`].
pub(crate) fn sync_transaction<H: Hardware>(
    hw: &mut H,
    config: &SessionConfig,
    frame: &mut Frame,
) -> Result<()> {
    frame.set_command_type(CommandType::SyncRequest);
    trace!(
        subsystem = frame.subsystem(),
        opcode = frame.opcode(),
        len = frame.payload_len(),
        "sync request"
    );

    hw.set_mrdy(Level::Low)?;
    let result = sync_exchange(hw, config, frame);
    if result.is_err() {
        // Leave the bus idle even when the exchange failed.
        let _ = hw.set_mrdy(Level::High);
    }
    result
}

fn sync_exchange<H: Hardware>(
    hw: &mut H,
    config: &SessionConfig,
    frame: &mut Frame,
) -> Result<()> {
    wait_srdy_bounded(hw, Level::Low, config.handshake_timeout)?;

    let mut buf = [0u8; HEADER_SIZE + MAX_PAYLOAD];
    let total = frame.encode_into(&mut buf);
    hw.transfer(&mut buf[..total])?;

    wait_srdy_bounded(hw, Level::High, config.handshake_timeout)?;

    // Release MRDY before the read-back. Deasserting after it would leave
    // the device seeing MRDY low at transaction end, which it reads as a
    // new transaction starting, and it would pull SRDY low again.
    hw.set_mrdy(Level::High)?;

    let (header, payload) = read_response(hw)?;
    hw.set_mrdy(Level::High)?;

    frame.set_response(header, payload);
    frame.set_command_type(CommandType::SyncResponse);
    trace!(len = frame.payload_len(), "sync response");
    Ok(())
}

/// Fire-and-forget send: the send half of the handshake only.
pub(crate) fn async_send<H: Hardware>(
    hw: &mut H,
    config: &SessionConfig,
    frame: &mut Frame,
) -> Result<()> {
    frame.set_command_type(CommandType::AsyncRequest);
    trace!(
        subsystem = frame.subsystem(),
        opcode = frame.opcode(),
        len = frame.payload_len(),
        "async request"
    );

    hw.set_mrdy(Level::Low)?;
    let result = send_only(hw, config, frame);
    // No response is read; MRDY is released whether or not the send landed.
    let released = hw.set_mrdy(Level::High).map_err(NpiError::from);
    result.and(released)
}

fn send_only<H: Hardware>(hw: &mut H, config: &SessionConfig, frame: &Frame) -> Result<()> {
    wait_srdy_bounded(hw, Level::Low, config.handshake_timeout)?;

    let mut buf = [0u8; HEADER_SIZE + MAX_PAYLOAD];
    let total = frame.encode_into(&mut buf);
    hw.transfer(&mut buf[..total])?;
    Ok(())
}

/// Zero-payload probe retrieving device-initiated data, in place in
/// `frame`.
///
/// Issued only after SRDY has been observed low - the device is already
/// holding the line for its pending data - so the transfer starts without
/// a preceding SRDY-low wait. The received command type is left exactly as
/// the device sent it; the receiver strips the type bits before delivery.
pub(crate) fn poll_transaction<H: Hardware>(
    hw: &mut H,
    config: &SessionConfig,
    frame: &mut Frame,
) -> Result<()> {
    debug_assert_eq!(frame.command_type(), Some(CommandType::Poll));
    trace!("poll");

    hw.set_mrdy(Level::Low)?;
    let result = poll_exchange(hw, config, frame);
    if result.is_err() {
        let _ = hw.set_mrdy(Level::High);
    }
    result
}

fn poll_exchange<H: Hardware>(
    hw: &mut H,
    config: &SessionConfig,
    frame: &mut Frame,
) -> Result<()> {
    let mut buf = [0u8; HEADER_SIZE];
    frame.encode_into(&mut buf);
    hw.transfer(&mut buf)?;

    // SRDY releasing this slowly means the device took the poll for a
    // reset handshake instead of answering it.
    let elapsed = wait_srdy_bounded(hw, Level::High, config.handshake_timeout)?;
    trace!(?elapsed, "srdy released after poll");

    hw.set_mrdy(Level::High)?;

    let (header, payload) = read_response(hw)?;
    frame.set_response(header, payload);
    Ok(())
}

/// One-time GPIO synchronization handshake establishing a known-good level
/// pair before normal traffic begins.
///
/// Sequence: wait SRDY low, assert MRDY, wait SRDY high, release MRDY,
/// confirm SRDY settled high.
pub(crate) fn synchronize<H: Hardware>(hw: &mut H, config: &SessionConfig) -> Result<()> {
    debug!("gpio synchronization handshake");

    wait_srdy_bounded(hw, Level::Low, config.handshake_timeout)?;
    hw.set_mrdy(Level::Low)?;
    let waited = wait_srdy_bounded(hw, Level::High, config.handshake_timeout).map(|_| ());
    let released = hw.set_mrdy(Level::High).map_err(NpiError::from);
    waited.and(released)?;

    if hw.srdy()?.is_high() {
        debug!("synchronization handshake complete");
        Ok(())
    } else {
        Err(NpiError::SyncFailed("SRDY did not settle high"))
    }
}

/// Pulse the RESET line, then sleep the configured settle time.
///
/// The settle delay is best-effort: the device offers no ready indication
/// after reset yet, so there is nothing to wait on.
pub(crate) fn reset_device<H: Hardware>(hw: &mut H, config: &SessionConfig) -> Result<()> {
    debug!("resetting device");
    hw.set_reset(Level::Low)?;
    hw.set_reset(Level::High)?;
    thread::sleep(config.reset_settle);
    Ok(())
}

/// Wait for SRDY to reach `level`, converting an expired or overlong wait
/// into the distinguished possible-reset condition.
fn wait_srdy_bounded<H: Hardware>(
    hw: &mut H,
    level: Level,
    timeout: Duration,
) -> Result<Duration> {
    match hw.wait_srdy(level, timeout)? {
        WaitOutcome::Reached { elapsed } if elapsed <= timeout => Ok(elapsed),
        // An adapter may report success past the bound; a wait that long
        // still means the device was off in a reset handshake.
        WaitOutcome::Reached { elapsed } => Err(NpiError::PossibleReset { elapsed }),
        WaitOutcome::TimedOut => Err(NpiError::PossibleReset { elapsed: timeout }),
    }
}

fn read_response<H: Hardware>(hw: &mut H) -> Result<(Header, Bytes)> {
    let mut hdr = [0u8; HEADER_SIZE];
    hw.transfer(&mut hdr)?;
    let header = Header::from_bytes(hdr);

    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        hw.transfer(&mut payload)?;
    }
    Ok((header, Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Mrdy(Level),
        Reset(Level),
        WaitSrdy(Level),
        Transfer(Vec<u8>),
    }

    /// Hardware double that logs every call and plays back scripted
    /// wait outcomes and clocked-in bytes.
    #[derive(Default)]
    struct ScriptedHardware {
        events: Vec<Event>,
        waits: VecDeque<WaitOutcome>,
        replies: VecDeque<Vec<u8>>,
        srdy_level: Option<Level>,
    }

    impl ScriptedHardware {
        fn new() -> Self {
            Self {
                srdy_level: Some(Level::High),
                ..Self::default()
            }
        }
    }

    impl Hardware for ScriptedHardware {
        fn open_bus(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn open_srdy(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn open_mrdy(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn open_reset(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn close_reset(&mut self) {}
        fn close_mrdy(&mut self) {}
        fn close_srdy(&mut self) {}
        fn close_bus(&mut self) {}

        fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()> {
            self.events.push(Event::Transfer(buf.to_vec()));
            if let Some(reply) = self.replies.pop_front() {
                buf[..reply.len()].copy_from_slice(&reply);
            }
            Ok(())
        }

        fn set_mrdy(&mut self, level: Level) -> io::Result<()> {
            self.events.push(Event::Mrdy(level));
            Ok(())
        }

        fn set_reset(&mut self, level: Level) -> io::Result<()> {
            self.events.push(Event::Reset(level));
            Ok(())
        }

        fn srdy(&mut self) -> io::Result<Level> {
            Ok(self.srdy_level.unwrap())
        }

        fn wait_srdy(&mut self, level: Level, _timeout: Duration) -> io::Result<WaitOutcome> {
            self.events.push(Event::WaitSrdy(level));
            Ok(self.waits.pop_front().unwrap_or(WaitOutcome::Reached {
                elapsed: Duration::from_micros(100),
            }))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            reset_settle: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_sync_transaction_sequence() {
        let mut hw = ScriptedHardware::new();
        // Request clocks nothing useful back; the response header claims
        // two payload bytes.
        hw.replies = VecDeque::from(vec![
            vec![],
            vec![0x02, CommandType::SyncResponse.bits() | 0x05, 0x01],
            vec![0xAA, 0xBB],
        ]);

        let mut frame = Frame::new(0x05, 0x01, vec![1, 2, 3]).unwrap();
        sync_transaction(&mut hw, &config(), &mut frame).unwrap();

        assert_eq!(
            hw.events,
            vec![
                Event::Mrdy(Level::Low),
                Event::WaitSrdy(Level::Low),
                Event::Transfer(vec![0x03, 0x25, 0x01, 1, 2, 3]),
                Event::WaitSrdy(Level::High),
                Event::Mrdy(Level::High),
                Event::Transfer(vec![0, 0, 0]),
                Event::Transfer(vec![0, 0]),
                Event::Mrdy(Level::High),
            ]
        );

        assert!(frame.is_sync_response());
        assert_eq!(frame.subsystem(), 0x05);
        assert_eq!(frame.payload(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_sync_response_type_rewritten_even_if_device_disagrees() {
        let mut hw = ScriptedHardware::new();
        // Device answers with cleared type bits; the caller still sees a
        // sync response.
        hw.replies = VecDeque::from(vec![vec![], vec![0x00, 0x05, 0x01]]);

        let mut frame = Frame::new(0x05, 0x01, Bytes::new()).unwrap();
        sync_transaction(&mut hw, &config(), &mut frame).unwrap();

        assert!(frame.is_sync_response());
    }

    #[test]
    fn test_sync_empty_response_reads_no_payload() {
        let mut hw = ScriptedHardware::new();
        hw.replies = VecDeque::from(vec![vec![], vec![0x00, 0x65, 0x01]]);

        let mut frame = Frame::new(0x05, 0x01, Bytes::new()).unwrap();
        sync_transaction(&mut hw, &config(), &mut frame).unwrap();

        let transfers = hw
            .events
            .iter()
            .filter(|e| matches!(e, Event::Transfer(_)))
            .count();
        assert_eq!(transfers, 2); // request + header dummy, no payload read
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_sync_wait_timeout_is_possible_reset() {
        let mut hw = ScriptedHardware::new();
        hw.waits = VecDeque::from(vec![WaitOutcome::TimedOut]);

        let mut frame = Frame::new(0x05, 0x01, Bytes::new()).unwrap();
        let err = sync_transaction(&mut hw, &config(), &mut frame).unwrap_err();

        assert!(matches!(err, NpiError::PossibleReset { .. }));
        // MRDY is released on the failure path too.
        assert_eq!(hw.events.last(), Some(&Event::Mrdy(Level::High)));
    }

    #[test]
    fn test_sync_late_wait_is_possible_reset() {
        let mut hw = ScriptedHardware::new();
        hw.waits = VecDeque::from(vec![
            WaitOutcome::Reached {
                elapsed: Duration::from_micros(50),
            },
            // SRDY released, but far past the bound.
            WaitOutcome::Reached {
                elapsed: Duration::from_millis(150),
            },
        ]);

        let mut frame = Frame::new(0x05, 0x01, Bytes::new()).unwrap();
        let err = sync_transaction(&mut hw, &config(), &mut frame).unwrap_err();

        match err {
            NpiError::PossibleReset { elapsed } => {
                assert_eq!(elapsed, Duration::from_millis(150));
            }
            other => panic!("expected PossibleReset, got {other:?}"),
        }
    }

    #[test]
    fn test_async_send_sequence() {
        let mut hw = ScriptedHardware::new();

        let mut frame = Frame::new(0x12, 0x34, vec![0xEE]).unwrap();
        async_send(&mut hw, &config(), &mut frame).unwrap();

        assert_eq!(
            hw.events,
            vec![
                Event::Mrdy(Level::Low),
                Event::WaitSrdy(Level::Low),
                Event::Transfer(vec![0x01, 0x52, 0x34, 0xEE]),
                Event::Mrdy(Level::High),
            ]
        );
        assert!(frame.is_async_request());
    }

    #[test]
    fn test_poll_transaction_sequence() {
        let mut hw = ScriptedHardware::new();
        hw.replies = VecDeque::from(vec![
            vec![],
            vec![0x01, CommandType::AsyncRequest.bits() | 0x07, 0x10],
            vec![0x99],
        ]);

        let mut frame = Frame::poll();
        poll_transaction(&mut hw, &config(), &mut frame).unwrap();

        // No SRDY-low wait precedes the poll write.
        assert_eq!(
            hw.events,
            vec![
                Event::Mrdy(Level::Low),
                Event::Transfer(vec![0, 0, 0]),
                Event::WaitSrdy(Level::High),
                Event::Mrdy(Level::High),
                Event::Transfer(vec![0, 0, 0]),
                Event::Transfer(vec![0]),
            ]
        );

        // The device's tag is preserved; stripping is the receiver's job.
        assert!(frame.is_async_request());
        assert_eq!(frame.subsystem(), 0x07);
        assert_eq!(frame.opcode(), 0x10);
        assert_eq!(frame.payload(), &[0x99]);
    }

    #[test]
    fn test_poll_slow_srdy_release_is_possible_reset() {
        let mut hw = ScriptedHardware::new();
        hw.waits = VecDeque::from(vec![WaitOutcome::Reached {
            elapsed: Duration::from_millis(200),
        }]);

        let mut frame = Frame::poll();
        let err = poll_transaction(&mut hw, &config(), &mut frame).unwrap_err();

        assert!(matches!(err, NpiError::PossibleReset { .. }));
        assert_eq!(hw.events.last(), Some(&Event::Mrdy(Level::High)));
    }

    #[test]
    fn test_synchronize_sequence() {
        let mut hw = ScriptedHardware::new();

        synchronize(&mut hw, &config()).unwrap();

        assert_eq!(
            hw.events,
            vec![
                Event::WaitSrdy(Level::Low),
                Event::Mrdy(Level::Low),
                Event::WaitSrdy(Level::High),
                Event::Mrdy(Level::High),
            ]
        );
    }

    #[test]
    fn test_synchronize_fails_when_srdy_does_not_settle() {
        let mut hw = ScriptedHardware::new();
        hw.srdy_level = Some(Level::Low);

        let err = synchronize(&mut hw, &config()).unwrap_err();
        assert!(matches!(err, NpiError::SyncFailed(_)));
    }

    #[test]
    fn test_reset_device_pulses_line() {
        let mut hw = ScriptedHardware::new();

        reset_device(&mut hw, &config()).unwrap();

        assert_eq!(
            hw.events,
            vec![Event::Reset(Level::Low), Event::Reset(Level::High)]
        );
    }
}
