//! Desktop notification surface

use async_trait::async_trait;
use std::sync::Arc;

use super::settings::LocalSettings;
use super::{NotificationRequest, NotificationSurface, Permission};

/// Shows notifications through the platform notifier
///
/// Uses `notify-send` on Linux and `osascript` on macOS. The permission is
/// remembered in [`LocalSettings`].
pub struct DesktopNotifier {
    settings: Arc<LocalSettings>,
}

impl DesktopNotifier {
    pub fn new(settings: Arc<LocalSettings>) -> Self {
        Self { settings }
    }

    /// Record an explicit user decision
    pub fn set_permission(&self, permission: Permission) -> Permission {
        match self
            .settings
            .update(|s| s.notification_permission = permission)
        {
            Ok(settings) => settings.notification_permission,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to save notification permission");
                self.permission()
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn command(request: &NotificationRequest) -> Option<tokio::process::Command> {
        let hint = format!("string:x-canonical-private-synchronous:{}", request.tag);
        let mut command = tokio::process::Command::new("notify-send");
        command.args([
            "--app-name=ratefeed",
            "-h",
            hint.as_str(),
            request.title.as_str(),
            request.body.as_str(),
        ]);
        Some(command)
    }

    #[cfg(target_os = "macos")]
    fn command(request: &NotificationRequest) -> Option<tokio::process::Command> {
        let script = format!(
            r#"display notification "{}" with title "{}""#,
            request.body.replace('"', r#"\""#),
            request.title.replace('"', r#"\""#)
        );
        let mut command = tokio::process::Command::new("osascript");
        command.args(["-e", script.as_str()]);
        Some(command)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn command(_request: &NotificationRequest) -> Option<tokio::process::Command> {
        None
    }
}

#[async_trait]
impl NotificationSurface for DesktopNotifier {
    fn permission(&self) -> Permission {
        self.settings.get().notification_permission
    }

    /// An undecided permission is granted; a denial is final
    fn request_permission(&self) -> Permission {
        match self.permission() {
            Permission::Default => self.set_permission(Permission::Granted),
            decided => decided,
        }
    }

    async fn show(&self, request: NotificationRequest) {
        if self.permission() != Permission::Granted {
            tracing::debug!(tag = %request.tag, "Notification suppressed without permission");
            return;
        }

        let Some(mut command) = Self::command(&request) else {
            tracing::info!(title = %request.title, body = %request.body, "Notification");
            return;
        };

        match command.output().await {
            Ok(output) if output.status.success() => {
                tracing::debug!(tag = %request.tag, "Desktop notification sent");
            }
            Ok(output) => {
                tracing::warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Desktop notification failed"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Desktop notifier unavailable");
            }
        }
    }
}
