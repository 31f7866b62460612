//! 入站字节流解析器
//!
//! 纯状态机：每次喂入一个字节，命令完整时返回 [`Command`]。不做任何 I/O。

use canmux_can::CanFrame;
use canmux_can::frame::MAX_DATA_LEN;
use tracing::{trace, warn};

use crate::protocol::{BINARY_MODE_BYTE, BusSetup, Command, EXTENDED_FLAG, START_BYTE, cmd};

/// SETUP_CANBUS 负载：CAN0 配置 (4) + CAN1 配置 (4) + 保留 (1)
const SETUP_CANBUS_LEN: usize = 9;

/// SET_EXT_BUSES 负载长度
const SET_EXT_BUSES_LEN: usize = 13;

/// BUILD_CAN_FRAME 固定部分：ID (4) + bus (1) + len (1) + 校验和 (1)
const BUILD_FRAME_OVERHEAD: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    GetCommand,
    BuildCanFrame { step: usize, len: usize },
    SetupCanbus { step: usize },
    SetExtBuses { step: usize },
}

/// GVRET 命令解析器
#[derive(Debug)]
pub struct Parser {
    state: State,
    buf: [u8; BUILD_FRAME_OVERHEAD + MAX_DATA_LEN],
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buf: [0; BUILD_FRAME_OVERHEAD + MAX_DATA_LEN],
        }
    }

    /// 处于命令边界（没有半条命令）
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    pub fn feed(&mut self, byte: u8) -> Option<Command> {
        match self.state {
            State::Idle => {
                match byte {
                    START_BYTE => self.state = State::GetCommand,
                    BINARY_MODE_BYTE => trace!("binary mode selector ignored"),
                    other => trace!("stray byte 0x{:02X} outside a command", other),
                }
                None
            },
            State::GetCommand => self.command(byte),
            State::BuildCanFrame { step, len } => self.build_frame(step, len, byte),
            State::SetupCanbus { step } => {
                if step < self.buf.len() {
                    self.buf[step] = byte;
                }
                let step = step + 1;
                if step < SETUP_CANBUS_LEN {
                    self.state = State::SetupCanbus { step };
                    return None;
                }
                self.state = State::Idle;
                let config = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                Some(Command::SetupCanbus(BusSetup(config)))
            },
            State::SetExtBuses { step } => {
                let step = step + 1;
                if step < SET_EXT_BUSES_LEN {
                    self.state = State::SetExtBuses { step };
                    None
                } else {
                    self.state = State::Idle;
                    Some(Command::SetExtBuses)
                }
            },
        }
    }

    fn command(&mut self, byte: u8) -> Option<Command> {
        self.state = State::Idle;
        match byte {
            cmd::GET_DEV_INFO => Some(Command::GetDevInfo),
            cmd::GET_NUMBUSES => Some(Command::GetNumBuses),
            cmd::GET_CANBUS_PARAMS => Some(Command::GetCanbusParams),
            cmd::GET_EXT_BUSES => Some(Command::GetExtBuses),
            cmd::KEEPALIVE => Some(Command::Keepalive),
            cmd::TIME_SYNC => Some(Command::TimeSync),
            cmd::SET_EXT_BUSES => {
                self.state = State::SetExtBuses { step: 0 };
                None
            },
            cmd::SETUP_CANBUS => {
                self.state = State::SetupCanbus { step: 0 };
                None
            },
            cmd::BUILD_CAN_FRAME => {
                self.state = State::BuildCanFrame { step: 0, len: 0 };
                None
            },
            BINARY_MODE_BYTE => None,
            other => {
                warn!("Unknown GVRET command 0x{:02X}", other);
                None
            },
        }
    }

    fn build_frame(&mut self, step: usize, len: usize, byte: u8) -> Option<Command> {
        if step < self.buf.len() {
            self.buf[step] = byte;
        }
        let len = if step == 5 {
            usize::from(byte & 0x0F).min(MAX_DATA_LEN)
        } else {
            len
        };
        let step = step + 1;
        if step < BUILD_FRAME_OVERHEAD + len {
            self.state = State::BuildCanFrame { step, len };
            return None;
        }

        self.state = State::Idle;
        let raw_id = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let extended = raw_id & EXTENDED_FLAG != 0;
        let bus = self.buf[4];
        let data = &self.buf[6..6 + len];
        match CanFrame::new(raw_id & !EXTENDED_FLAG, data, extended) {
            Ok(frame) => Some(Command::BuildCanFrame { bus, frame }),
            Err(e) => {
                warn!("Dropping malformed BUILD_CAN_FRAME: {}", e);
                None
            },
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_build_frame;
    use proptest::prelude::*;

    fn feed_all(parser: &mut Parser, bytes: &[u8]) -> Vec<Command> {
        bytes.iter().filter_map(|b| parser.feed(*b)).collect()
    }

    #[test]
    fn test_simple_commands() {
        let mut parser = Parser::new();
        let out = feed_all(
            &mut parser,
            &[0xF1, 0x07, 0xF1, 0x0C, 0xF1, 0x06, 0xF1, 0x0D, 0xF1, 0x09, 0xF1, 0x01],
        );
        assert_eq!(
            out,
            vec![
                Command::GetDevInfo,
                Command::GetNumBuses,
                Command::GetCanbusParams,
                Command::GetExtBuses,
                Command::Keepalive,
                Command::TimeSync,
            ]
        );
        assert!(parser.is_idle());
    }

    #[test]
    fn test_setup_canbus_consumes_nine_bytes() {
        let mut parser = Parser::new();
        let out = feed_all(
            &mut parser,
            &[0xF1, 0x05, 0x40, 0x42, 0x0F, 0x80, 0, 0, 0, 0, 0],
        );
        assert_eq!(out, vec![Command::SetupCanbus(BusSetup(0x800F_4240))]);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_build_frame_with_checksum() {
        let mut parser = Parser::new();
        let out = feed_all(
            &mut parser,
            &[0xF1, 0x00, 0x23, 0x01, 0x00, 0x00, 0x00, 0x02, 0x8A, 0xB1, 0xCD, 0xEF, 0x00],
        );
        let frame = CanFrame::new_standard(0x123, &[0x8A, 0xB1]).unwrap();
        assert_eq!(out, vec![Command::BuildCanFrame { bus: 0, frame }]);
        assert!(parser.is_idle());
    }

    /// 长度半字节 0x0A 被截到 8，随后正好消费 8 个数据字节和 1 个校验和
    #[test]
    fn test_dlc_nibble_is_clamped() {
        let mut parser = Parser::new();
        let mut bytes = vec![0xF1, 0x00, 0x23, 0x01, 0x00, 0x00, 0x00, 0x8A];
        bytes.extend(1..=8u8);
        bytes.push(0xFF);
        let out = feed_all(&mut parser, &bytes);
        assert_eq!(out.len(), 1);
        let Command::BuildCanFrame { frame, .. } = &out[0] else {
            panic!("expected a frame, got {:?}", out[0]);
        };
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_extended_flag_and_bus() {
        let mut parser = Parser::new();
        let out = feed_all(
            &mut parser,
            &[0xF1, 0x00, 0x78, 0x56, 0x34, 0x92, 0x01, 0x00, 0x00],
        );
        let frame = CanFrame::new_extended(0x1234_5678, &[]).unwrap();
        assert_eq!(out, vec![Command::BuildCanFrame { bus: 1, frame }]);
    }

    #[test]
    fn test_set_ext_buses_is_swallowed() {
        let mut parser = Parser::new();
        let mut bytes = vec![0xF1, 0x0E];
        bytes.extend([0xF1; 13]);
        bytes.extend([0xF1, 0x09]);
        assert_eq!(
            feed_all(&mut parser, &bytes),
            vec![Command::SetExtBuses, Command::Keepalive]
        );
    }

    #[test]
    fn test_unknown_and_binary_mode_bytes() {
        let mut parser = Parser::new();
        assert!(parser.feed(0xE7).is_none());
        assert!(parser.is_idle());

        assert!(parser.feed(0xF1).is_none());
        assert!(parser.feed(0xE7).is_none());
        assert!(parser.is_idle());

        // 已识别但无处理的命令码同样回到 IDLE
        for code in [0x02, 0x03, 0x04, 0x08, 0x0A, 0x0B, 0x55] {
            parser.feed(0xF1);
            assert!(parser.feed(code).is_none());
            assert!(parser.is_idle());
        }
    }

    #[test]
    fn test_reset_discards_partial_command() {
        let mut parser = Parser::new();
        feed_all(&mut parser, &[0xF1, 0x05, 0x01, 0x02]);
        assert!(!parser.is_idle());
        parser.reset();
        assert!(parser.is_idle());
        assert_eq!(feed_all(&mut parser, &[0xF1, 0x09]), vec![Command::Keepalive]);
    }

    proptest! {
        #[test]
        fn test_build_frame_commands_parse_back(
            id in any::<u32>(),
            extended in any::<bool>(),
            data in proptest::collection::vec(any::<u8>(), 0..=8),
        ) {
            let frame = CanFrame::new(id, &data, extended).unwrap();
            let mut parser = Parser::new();
            let out = feed_all(&mut parser, &encode_build_frame(&frame, 0));
            prop_assert_eq!(out, vec![Command::BuildCanFrame { bus: 0, frame }]);
            prop_assert!(parser.is_idle());
        }
    }
}
