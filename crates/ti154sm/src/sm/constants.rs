//! Constants for the commissioning Security Manager

// Outer message kinds carried in the first byte of every SM frame
pub const SM_MSG_COMMISSION_START: u8 = 14;
pub const SM_MSG_COMMISSION_MSG: u8 = 15;

// SM command ids
pub const SM_CMD_PROCESS_REQUEST: u16 = 0xCF10;
pub const SM_CMD_PROCESS_RESPONSE: u16 = 0xCF20;
pub const SM_CMD_METHOD_CONFIRM: u16 = 0xCF30;
pub const SM_CMD_PASSKEY_CONFIRM: u16 = 0xCF40;
pub const SM_CMD_PUBLIC_KEY: u16 = 0xCF50;
pub const SM_CMD_SECURITY_VAL: u16 = 0xCF60;
pub const SM_CMD_CODE_NONCE: u16 = 0xCF70;
pub const SM_CMD_SUCCESS: u16 = 0xCF80;
pub const SM_CMD_FAIL: u16 = 0xCF90;
pub const SM_CMD_KEY_REFRESH_REQUEST: u16 = 0xCFA0;
pub const SM_CMD_NO_MSG: u16 = 0xFFFF;

/// Mask selecting the command family; the low nibble carries the iteration
pub const SM_CMD_FAMILY_MASK: u16 = 0xFFF0;
pub const SM_CMD_ITERATION_MASK: u16 = 0x000F;

/// Length of the envelope header (kind + command id)
pub const SM_BASE_CMD_LENGTH: usize = 3;

// Authentication methods (bitmask values)
pub const SM_AUTH_METHOD_PASSKEY: u8 = 0x01;
pub const SM_AUTH_METHOD_DEFAULT_CODE: u8 = 0x02;
pub const SM_AUTH_METHOD_JUST_ALLOWED: u8 = 0x04;

// Error codes carried in processFail
pub const SM_ERROR_NONE: u8 = 0x11;
pub const SM_ERROR_UNSUPPORTED_AUTH_METHOD: u8 = 0x12;
pub const SM_ERROR_NO_MATCH_AUTH_VAL: u8 = 0x13;
pub const SM_ERROR_NO_MATCH_KEY_CONFIRM: u8 = 0x14;
pub const SM_ERROR_MISSING_KEY: u8 = 0x19;
pub const SM_ERROR_UNEXPECTED_MSG: u8 = 0x1A;
pub const SM_ERROR_TIMEOUT: u8 = 0x1B;
pub const SM_ERROR_PEER_UNRESPONSIVE: u8 = 0x1C;

// MSDU handles used for SM traffic
pub const SM_DATA_MSDU_HANDLE: u8 = 0x20;
pub const SM_FAIL_MSDU_HANDLE: u8 = 0x40;

// Key material sizes
pub const SM_ECC_KEY_LEN: usize = 32;
pub const SM_ECC_PUBLIC_KEY_LEN: usize = 65;
pub const SM_KEY_LEN: usize = 16;
pub const SM_AUTH_CODE_LEN: usize = 16;
pub const SM_AUTH_NONCE_LEN: usize = 16;
pub const SM_AUTH_CODE_NONCE_LEN: usize = SM_AUTH_CODE_LEN + SM_AUTH_NONCE_LEN;
pub const SM_KEY_GEN_DATA_LEN: usize = 16;
pub const SM_PASSKEY_BUF_LEN: usize = 16;
pub const SM_AUTH_METHOD_BUF_LEN: usize = 3;
pub const SM_AUTH_METHOD_FAIL_BUF_LEN: usize = 2;
pub const SM_EXT_ADDR_LEN: usize = 8;
pub const SM_ADDRESS_LEN: usize = 7;
pub const SM_KEY_SOURCE_LEN: usize = 8;
pub const SM_KEY_LOOKUP_LONG_LEN: usize = 9;
pub const SM_DEVICE_DESCRIPTOR_LEN: usize = 12;

/// Upper bound on authentication iterations (20 bits tested 4 at a time is 5)
pub const SM_MAX_AUTH_ITERATIONS: usize = 8;

// Passkey defaults
pub const SM_PASSKEY_SIZE_BITS: u8 = 20;
pub const SM_PASSKEY_TEST_ONE_BIT: u8 = 1;
pub const SM_PASSKEY_TEST_ONE_DIGIT: u8 = 4;
pub const SM_DEFAULT_AUTH_CODE: u32 = 0x54321;

// Retry ceilings
pub const SM_PKT_MAX_RETRY_ATTEMPTS: u8 = 5;
pub const SM_CM_MAX_RETRY_ATTEMPTS: u8 = 3;

// Timeouts (milliseconds)
pub const SM_USER_INPUT_TIMEOUT: u32 = 30_000;
pub const SM_POLLING_INTERVAL: u32 = 2_000;
pub const SM_KEY_REFRESH_PERIOD: u32 = 7_200_000;

// MAC security settings reported for commissioned sources
pub const SM_SEC_LEVEL_ENC_MIC_32: u8 = 0x05;
pub const SM_KEY_ID_MODE_8: u8 = 0x03;

/// 128-bit salt used by f2, most significant byte first
pub const SM_F2_SALT: [u8; 16] = [
    0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83, 0xBE,
];

/// keyID "btle", most significant byte first
pub const SM_F2_KEY_ID: [u8; 4] = *b"btle";

/// f2 output length in bits (256), big-endian
pub const SM_F2_LENGTH: [u8; 2] = [0x01, 0x00];

pub const SM_F1_INPUT_LEN: usize = 2 * SM_ECC_KEY_LEN + 1;
pub const SM_F2_INPUT_LEN: usize = 1 + 4 + 2 * SM_KEY_LEN + 2 * SM_ADDRESS_LEN + 2;
pub const SM_F3_INPUT_LEN: usize =
    3 * SM_KEY_LEN + SM_AUTH_METHOD_BUF_LEN + 2 * SM_ADDRESS_LEN;
