//! Connection and reconnection options.

use std::time::Duration;

/// Default time to wait for the result of a command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of the buffer used to receive one frame.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Management connection options.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionConfig {
    /// Time to wait for the status or completion event of a command.
    pub command_timeout: Duration,
    /// Size of the receive buffer.
    ///
    /// Frames longer than this are truncated by the kernel and will fail to decode.
    pub read_buffer_size: usize,
    /// Serialize commands with the same controller index and opcode.
    ///
    /// The kernel echoes only the opcode in its completion events, so two
    /// such commands in flight cannot be told apart.
    pub serialize_opcodes: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            serialize_opcodes: true,
        }
    }
}

/// Policy for replacing a closed connection.
///
/// The delay before attempt `n` (counting from zero) is
/// `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound of the delay between attempts.
    pub max_delay: Duration,
    /// Factor applied to the delay after each attempt.
    pub multiplier: u32,
}

impl ReconnectPolicy {
    const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
    const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
    const DEFAULT_MULTIPLIER: u32 = 2;

    /// Delay before the specified attempt, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.checked_mul(factor).unwrap_or(self.max_delay).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            multiplier: Self::DEFAULT_MULTIPLIER,
        }
    }
}
