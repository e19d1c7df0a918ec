//! Protocol constants shared by the coin cache and the block store.

/// Height recorded for coins created by transactions that are not yet in a block.
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

/// `OP_FALSE` / `OP_0` opcode.
pub const OP_FALSE: u8 = 0x00;

/// `OP_RETURN` opcode.
pub const OP_RETURN: u8 = 0x6a;

/// Scripts longer than this are unspendable before genesis activation.
pub const MAX_SCRIPT_SIZE_BEFORE_GENESIS: usize = 10_000;

/// Default height at which genesis script rules activate (mainnet).
pub const DEFAULT_GENESIS_ACTIVATION_HEIGHT: u32 = 620_538;
