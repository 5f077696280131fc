//! Asking a user to approve permissions
//!
//! Hosts decide how approval is collected by choosing a
//! [`ConfirmationHandler`]: a terminal prompt, a fixed answer, or a recorder
//! for tests.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Mutex;
use thiserror::Error;
use weave_plugin_api::PluginPermission;

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("Confirmation cancelled by user")]
    Cancelled,

    #[error("Non-interactive environment")]
    NonInteractive,

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// What the user is asked to approve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub plugin_id: String,
    pub plugin_name: String,
    pub permissions: Vec<PluginPermission>,
    /// The plugin already had grants and now asks for a different set
    pub escalation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationResult {
    /// Approve for this load only
    Approve,
    /// Approve and remember the grant
    ApproveAlways,
    #[default]
    Deny,
}

impl ConfirmationResult {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve | Self::ApproveAlways)
    }

    pub fn should_persist(&self) -> bool {
        matches!(self, Self::ApproveAlways)
    }
}

/// Collects the user's decision on a permission request
///
/// # Example
///
/// ```rust
/// use weave_plugin_host::sandbox::{
///     ConfirmationError, ConfirmationHandler, ConfirmationRequest, ConfirmationResult,
/// };
///
/// struct ApproveUiOnly;
///
/// impl ConfirmationHandler for ApproveUiOnly {
///     fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationResult, ConfirmationError> {
///         if request.permissions.iter().all(|p| p.as_str().starts_with("ui.")) {
///             Ok(ConfirmationResult::Approve)
///         } else {
///             Ok(ConfirmationResult::Deny)
///         }
///     }
///
///     fn is_interactive(&self) -> bool {
///         false
///     }
/// }
/// ```
pub trait ConfirmationHandler: Send + Sync {
    fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationResult, ConfirmationError>;

    fn is_interactive(&self) -> bool;
}

// ============================================================================
// Terminal Confirmation Handler
// ============================================================================

#[derive(Debug)]
pub struct TerminalConfirmationHandler {
    verbose: bool,
}

impl TerminalConfirmationHandler {
    pub fn new() -> Self {
        Self { verbose: true }
    }

    /// Only list permission names, not descriptions
    pub fn minimal() -> Self {
        Self { verbose: false }
    }

    fn format_permissions(&self, permissions: &[PluginPermission]) -> String {
        permissions
            .iter()
            .map(|p| {
                let meta = p.metadata();
                if self.verbose {
                    format!("  - {} [{:?}]: {}", p, meta.level, meta.description)
                } else {
                    format!("  - {}", p)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for TerminalConfirmationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationHandler for TerminalConfirmationHandler {
    fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationResult, ConfirmationError> {
        if !self.is_interactive() {
            return Err(ConfirmationError::NonInteractive);
        }

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        writeln!(stdout)?;
        if request.escalation {
            writeln!(
                stdout,
                "WARNING: Plugin \"{}\" ({}) requests DIFFERENT permissions than before!",
                request.plugin_name, request.plugin_id
            )?;
        } else {
            writeln!(
                stdout,
                "Plugin \"{}\" ({}) requests the following permissions:",
                request.plugin_name, request.plugin_id
            )?;
        }
        writeln!(stdout)?;
        writeln!(stdout, "{}", self.format_permissions(&request.permissions))?;
        writeln!(stdout)?;

        write!(stdout, "Allow? [y]es / [n]o / [a]lways: ")?;
        stdout.flush()?;

        let mut input = String::new();
        stdin.lock().read_line(&mut input)?;

        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(ConfirmationResult::Approve),
            "a" | "always" => Ok(ConfirmationResult::ApproveAlways),
            "n" | "no" | "" => Ok(ConfirmationResult::Deny),
            _ => {
                writeln!(stdout, "Invalid input, defaulting to deny")?;
                Ok(ConfirmationResult::Deny)
            }
        }
    }

    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }
}

// ============================================================================
// Auto Confirmation Handler
// ============================================================================

/// Answers every request the same way
#[derive(Debug)]
pub struct AutoConfirmationHandler {
    response: ConfirmationResult,
}

impl AutoConfirmationHandler {
    pub fn always_approve() -> Self {
        Self {
            response: ConfirmationResult::ApproveAlways,
        }
    }

    pub fn always_deny() -> Self {
        Self {
            response: ConfirmationResult::Deny,
        }
    }

    pub fn with_response(response: ConfirmationResult) -> Self {
        Self { response }
    }
}

impl ConfirmationHandler for AutoConfirmationHandler {
    fn confirm(&self, _request: &ConfirmationRequest) -> Result<ConfirmationResult, ConfirmationError> {
        Ok(self.response)
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

// ============================================================================
// Recording Confirmation Handler
// ============================================================================

/// Records requests and answers with a fixed response
#[derive(Debug, Default)]
pub struct RecordingConfirmationHandler {
    requests: Mutex<Vec<ConfirmationRequest>>,
    response: ConfirmationResult,
}

impl RecordingConfirmationHandler {
    pub fn new(response: ConfirmationResult) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            response,
        }
    }

    pub fn requests(&self) -> Vec<ConfirmationRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl ConfirmationHandler for RecordingConfirmationHandler {
    fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationResult, ConfirmationError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(self.response)
    }

    fn is_interactive(&self) -> bool {
        false
    }
}
