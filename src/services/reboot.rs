use log::info;

/// Latching restart request
///
/// Once requested it stays pending; the device loop acts on it in its next
/// iteration.
#[derive(Debug, Default)]
pub struct RebootFlag {
    pending: bool,
}

impl RebootFlag {
    pub fn request(&mut self, reason: &str) {
        if !self.pending {
            info!("reboot requested: {reason}");
        }
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}
