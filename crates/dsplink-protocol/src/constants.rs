//! Protocol constants
//!
//! Bit masks and opcodes for the device's framing layer, plus the fixed values
//! the device expects inside every JSON command.

// ============================================================================
// Frame header bits
// ============================================================================

/// FIN bit in the first header byte.
pub const FIN: u8 = 0x80;
/// Reserved bit 1. Must be zero.
pub const RSV1: u8 = 0x40;
/// Reserved bit 2. Must be zero.
pub const RSV2: u8 = 0x20;
/// Reserved bit 3. Must be zero.
pub const RSV3: u8 = 0x10;
/// Opcode bits in the first header byte.
pub const OPCODE_MASK: u8 = 0x0F;
/// MASK bit in the second header byte.
pub const MASK_BIT: u8 = 0x80;
/// 7-bit payload length in the second header byte.
pub const LENGTH_MASK: u8 = 0x7F;

/// Largest length that fits directly in the 7-bit length field.
pub const MAX_INLINE_LENGTH: usize = 125;
/// Length marker announcing a 2-byte extended length.
pub const LENGTH_16_MARKER: u8 = 126;
/// Length marker announcing an 8-byte extended length.
pub const LENGTH_64_MARKER: u8 = 127;
/// Largest payload the encoder will produce.
pub const MAX_ENCODED_PAYLOAD: usize = 65_535;
/// Sanity bound applied to decoded extended lengths.
pub const MAX_DECODED_LENGTH: u64 = 2_000_000_000;
/// Size of the masking key.
pub const MASK_KEY_SIZE: usize = 4;

// ============================================================================
// Opcodes
// ============================================================================

/// Continuation frame.
pub const OP_CONTINUATION: u8 = 0;
/// Text frame.
pub const OP_TEXT: u8 = 1;
/// Binary frame.
pub const OP_BINARY: u8 = 2;
/// Connection close.
pub const OP_CLOSE: u8 = 8;
/// Ping.
pub const OP_PING: u8 = 9;
/// Pong.
pub const OP_PONG: u8 = 10;

// ============================================================================
// Command envelope
// ============================================================================

/// Sequence id sent with every command. The device ignores its value.
pub const SEQUENCE_ID: u32 = 1001;
/// Local connection id sent with every command. The device ignores its value.
pub const LOCAL_CID: u32 = 41566;
/// Client id sent with every command.
pub const CLIENT_ID: &str = "";

// ============================================================================
// Command names
// ============================================================================

/// Sign-in command; returns `device_id` and `salt`.
pub const CMD_SIGN_IN: &str = "sign_in";
/// Device status query.
pub const CMD_DEVICE_STATUS: &str = "device_status";
/// Wireless survey.
pub const CMD_WLAN_SURVEY: &str = "wlan_survey";
/// Firmware upgrade from a URL.
pub const CMD_FW_UPGRADE: &str = "fw_upgrade";
/// Cloud registration.
pub const CMD_REGISTER: &str = "register";
/// Read one or more settings.
pub const CMD_GET_SETTING: &str = "get_setting";
/// Write one or more settings.
pub const CMD_SET_SETTING: &str = "set_setting";
/// Keep-alive. The device may also echo these asynchronously.
pub const CMD_KEEP_ALIVE: &str = "keep_alive";
/// Setup status query.
pub const CMD_GET_SETUP_STATUS: &str = "get_setup_status";

// ============================================================================
// Setting types
// ============================================================================

/// Socket/relay setting class.
pub const TYPE_SOCKET: u16 = 16;
/// LED setting class.
pub const TYPE_LED: u16 = 41;

/// Setting index that addresses every socket at once.
pub const ALL_SOCKETS: i32 = -1;
