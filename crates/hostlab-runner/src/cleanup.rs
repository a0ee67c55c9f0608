use std::process::Command;

use anyhow::{anyhow, Result};
use hostlab_core::run_checked_command;

pub const ADB_BINARY: &str = "adb";
pub const FASTBOOT_BINARY: &str = "fastboot";
pub const DEFAULT_ACCESS_POINT: &str = "GoogleGuest";

const WIFI_UTIL_INSTRUMENTATION: &str = "com.android.tradefed.utils.wifi/.WifiUtil";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStep {
    RebootBootloader,
    EraseMetadata,
    Reboot,
    WaitForDevice,
    EnableNetwork { access_point: String },
}

impl CleanupStep {
    pub fn sequence(access_point: &str) -> Vec<CleanupStep> {
        vec![
            CleanupStep::RebootBootloader,
            CleanupStep::EraseMetadata,
            CleanupStep::Reboot,
            CleanupStep::WaitForDevice,
            CleanupStep::EnableNetwork {
                access_point: access_point.to_string(),
            },
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            CleanupStep::RebootBootloader => "reboot_bootloader",
            CleanupStep::EraseMetadata => "erase_metadata",
            CleanupStep::Reboot => "reboot",
            CleanupStep::WaitForDevice => "wait_for_device",
            CleanupStep::EnableNetwork { .. } => "enable_network",
        }
    }

    /// Command lines (program first) that carry out this step on `serial`.
    pub fn commands(&self, serial: &str) -> Vec<Vec<String>> {
        match self {
            CleanupStep::RebootBootloader => {
                vec![argv(ADB_BINARY, serial, &["reboot", "bootloader"])]
            }
            CleanupStep::EraseMetadata => vec![argv(
                FASTBOOT_BINARY,
                serial,
                &["erase", "metadata", "--", "-w"],
            )],
            CleanupStep::Reboot => vec![argv(FASTBOOT_BINARY, serial, &["reboot"])],
            CleanupStep::WaitForDevice => vec![argv(ADB_BINARY, serial, &["wait-for-device"])],
            CleanupStep::EnableNetwork { access_point } => {
                wifi_commands(serial, true, Some(access_point))
            }
        }
    }
}

fn argv(program: &str, serial: &str, rest: &[&str]) -> Vec<String> {
    let mut out = vec![program.to_string(), "-s".to_string(), serial.to_string()];
    out.extend(rest.iter().map(|s| s.to_string()));
    out
}

/// `svc wifi enable|disable`, plus the connect instrumentation when enabling
/// with a non-empty access point.
pub fn wifi_commands(serial: &str, enable: bool, access_point: Option<&str>) -> Vec<Vec<String>> {
    let toggle = if enable { "enable" } else { "disable" };
    let mut commands = vec![argv(ADB_BINARY, serial, &["shell", "svc", "wifi", toggle])];
    if let Some(ap) = access_point.filter(|ap| enable && !ap.is_empty()) {
        commands.push(argv(
            ADB_BINARY,
            serial,
            &[
                "shell",
                "am",
                "instrument",
                "-e",
                "method",
                "connectToNetwork",
                "-e",
                "ssid",
                ap,
                "-w",
                WIFI_UTIL_INSTRUMENTATION,
            ],
        ));
    }
    commands
}

pub trait DeviceCommander {
    fn run(&mut self, serial: &str, step: &CleanupStep) -> Result<()>;
}

/// Runs steps through the `adb` and `fastboot` binaries on PATH.
#[derive(Debug, Default)]
pub struct AdbDeviceCommander;

impl AdbDeviceCommander {
    pub fn run_commands(&self, commands: &[Vec<String>]) -> Result<()> {
        for command in commands {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow!("empty device command"))?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            run_checked_command(cmd, &command.join(" "))?;
        }
        Ok(())
    }
}

impl DeviceCommander for AdbDeviceCommander {
    fn run(&mut self, serial: &str, step: &CleanupStep) -> Result<()> {
        tracing::info!(serial, step = step.name(), "device cleanup step");
        self.run_commands(&step.commands(serial))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCleanup {
    pub serial: String,
    pub completed: Vec<&'static str>,
    /// Step name and error of the step that aborted this serial.
    pub failed: Option<(&'static str, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub serials: Vec<SerialCleanup>,
}

impl CleanupReport {
    pub fn all_succeeded(&self) -> bool {
        self.serials.iter().all(|s| s.failed.is_none())
    }
}

/// Resets each serial in turn. A failing step skips the rest of that
/// serial's steps; other serials still run.
pub fn cleanup_devices(
    commander: &mut dyn DeviceCommander,
    serials: &[String],
    access_point: &str,
) -> CleanupReport {
    let steps = CleanupStep::sequence(access_point);
    let mut report = CleanupReport::default();
    for serial in serials {
        let mut entry = SerialCleanup {
            serial: serial.clone(),
            completed: Vec::new(),
            failed: None,
        };
        for step in &steps {
            match commander.run(serial, step) {
                Ok(()) => entry.completed.push(step.name()),
                Err(err) => {
                    tracing::error!(serial = %serial, step = step.name(), error = %err, "device cleanup aborted");
                    entry.failed = Some((step.name(), err.to_string()));
                    break;
                }
            }
        }
        report.serials.push(entry);
    }
    report
}
