//! Exempts connections of privileged users from throttling.

use proxygate_admission::TokenRegistry;
use proxygate_transport::{ConnControl, THROTTLE_KIND};
use serde_json::Value;
use tracing::trace;

/// Locks `conn` out of throttling if `token` belongs to a privileged user.
///
/// Returns true if the lock message was sent. The lock is permanent for the
/// connection, so a later "enable" from a less trusted filter has no effect.
pub fn apply_privilege<C: ConnControl + ?Sized>(tokens: &TokenRegistry, token: &str, conn: &C) -> bool {
    if !tokens.is_privileged(token) {
        return false;
    }
    trace!("privileged token presented, disabling throttling");
    conn.control_message(THROTTLE_KIND, &Value::from("lock"));
    true
}
