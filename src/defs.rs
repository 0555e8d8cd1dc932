use std::time::Duration;

/// Name of the legacy code page the terminal speaks on both sockets.
pub const TERMINAL_CHARSET: &str = "windows-1251";

/// Keep-alive line sent by the bridge on each healthy channel.
pub const PING: &str = "ping";

/// Keep-alive reply sent back by the terminal. Never parsed as JSON.
pub const PONG: &str = "pong";

/// Farewell line sent on each channel before the sockets are closed.
pub const QUIT: &str = "quit";

/// Pause before the transport retries to open its sockets after an error.
///
/// Both channels stay closed for at least this long once any of them failed.
pub const ERROR_TIMEOUT: Duration = Duration::from_secs(60);

/// Period between two `ping` lines when the channels are healthy.
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Listening loop pause when an iteration consumed no lines at all.
///
/// Reducing this value makes responses arrive sooner but increases CPU usage.
pub const IDLE_SLEEP_TIMEOUT: Duration = Duration::from_millis(10);

/// Listening loop pause while the transport waits out [`ERROR_TIMEOUT`].
pub const ERROR_SLEEP_TIMEOUT: Duration = Duration::from_millis(100);

/// Read timeout of a socket connector. A read that times out means
/// "no complete line yet", not a broken stream.
pub const SOCKET_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Upper bound for establishing a single TCP connection to the terminal.
pub const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest inbound line a connector buffers before giving up on the stream.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Deadline of every request the session manager issues.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period after a channel exception. Longer than [`ERROR_TIMEOUT`]
/// so the transport has reconnected before the session checks again.
pub const PAUSE_AFTER_EXCEPTION: Duration = Duration::from_secs(65);

/// Period of the `isConnected()` check.
pub const CHECK_CONNECTED_PERIOD: Duration = Duration::from_secs(5);

/// Retry period of a failed subscription round.
pub const SUBSCRIPTION_PERIOD: Duration = Duration::from_secs(15);

/// How long the terminal must report itself connected before the session is online.
pub const ONLINE_DURATION: Duration = Duration::from_secs(30);
