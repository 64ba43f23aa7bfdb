//! Emulator-backed device adapter driven through the `adb` command line.
//!
//! Actions are injected with `input`, state is read with `uiautomator dump`,
//! `screencap` and `dumpsys window`, crashes are probed through logcat, and
//! snapshots use the emulator console (`adb emu avd snapshot ...`).

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::adapter::Device;
use super::hierarchy::{parse_crash, parse_focus, parse_hierarchy};
use super::types::{Bounds, DeviceError, DeviceResult, Screenshot, SnapshotHandle, UiState};
use crate::config::DeviceSettings;
use crate::explore::action::{Action, ActionKind, Direction, GlobalAction, Orientation};

const DUMP_PATH: &str = "/sdcard/window_dump.xml";
const LONG_PRESS_MS: u32 = 800;
const SWIPE_MS: u32 = 300;
/// Grid step when checking a restored screen for the all-black failure mode
const BLACK_SAMPLE_STEP: u32 = 50;

/// Captured output of one adb invocation
#[derive(Debug)]
struct AdbOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl AdbOutput {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

pub struct AdbDevice {
    settings: DeviceSettings,
    package: String,
    /// Activity passed to the last `launch`, reused by `relaunch`
    activity: Option<String>,
    next_snapshot: u64,
    screen: Option<(i32, i32)>,
}

impl AdbDevice {
    pub fn new(settings: DeviceSettings, package: impl Into<String>) -> Self {
        Self {
            settings,
            package: package.into(),
            activity: None,
            next_snapshot: 0,
            screen: None,
        }
    }

    /// Verify the emulator is attached and answering
    pub fn connect(&mut self) -> DeviceResult<()> {
        let out = self.adb(&["get-state"])?;
        let state = out.text();
        if !out.success || state.trim() != "device" {
            return Err(DeviceError::Emulator(format!(
                "{} is not ready: {}{}",
                self.settings.serial,
                state.trim(),
                out.stderr.trim()
            )));
        }
        let status = self.emu(&["avd", "status"])?;
        info!(serial = %self.settings.serial, status = %status.lines().next().unwrap_or_default(), "emulator connected");
        Ok(())
    }

    /// Start the target app, through its launcher intent unless an activity is given
    pub fn launch(&mut self, activity: Option<&str>) -> DeviceResult<()> {
        self.activity = activity.map(str::to_string);
        let out = match activity {
            Some(activity) => {
                let component = format!("{}/{}", self.package, activity);
                self.shell(&["am", "start", "-W", "-n", &component])?
            }
            None => self.shell(&[
                "monkey",
                "-p",
                self.package.as_str(),
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ])?,
        };
        if !out.success {
            return Err(DeviceError::Emulator(format!("failed to launch {}: {}", self.package, out.stderr)));
        }
        self.settle();
        // Drop crashes from before the run
        self.adb(&["logcat", "-c"])?;
        Ok(())
    }

    /// Run `adb -s <serial> <args>` with the configured command timeout
    fn adb(&self, args: &[&str]) -> DeviceResult<AdbOutput> {
        let mut child = Command::new(&self.settings.adb)
            .arg("-s")
            .arg(&self.settings.serial)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Io(std::io::Error::other("Failed to capture stdout")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeviceError::Io(std::io::Error::other("Failed to capture stderr")))?;

        // Drain pipes on reader threads so large screencaps cannot stall the child
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = tx.send(stdout.read_to_end(&mut buf).map(|_| buf));
        });
        let err_reader = thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        });

        let timeout = Duration::from_secs(self.settings.command_timeout);
        let start = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if start.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DeviceError::Emulator(format!(
                        "adb {} timed out after {:?}",
                        args.join(" "),
                        timeout
                    )));
                }
                None => thread::sleep(Duration::from_millis(20)),
            }
        };

        let stdout = rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| DeviceError::Emulator("adb output reader did not finish".to_string()))??;
        let stderr = err_reader.join().unwrap_or_default();

        debug!(args = %args.join(" "), code = ?status.code(), bytes = stdout.len(), "adb");
        Ok(AdbOutput {
            success: status.success(),
            stdout,
            stderr,
        })
    }

    fn shell(&self, args: &[&str]) -> DeviceResult<AdbOutput> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.adb(&full)
    }

    /// Emulator console command; the console reports success with a final `OK` line
    fn emu(&self, args: &[&str]) -> DeviceResult<String> {
        let mut full = vec!["emu"];
        full.extend_from_slice(args);
        let out = self.adb(&full)?;
        let text = format!("{}\n{}", out.text(), out.stderr).trim().to_string();
        if text.lines().last().map(|l| l.starts_with("OK")).unwrap_or(false) {
            Ok(text)
        } else if text.is_empty() {
            Err(DeviceError::Emulator(format!("emu {}: emulator did not answer", args.join(" "))))
        } else {
            Err(DeviceError::Emulator(format!("emu {}: {}", args.join(" "), text)))
        }
    }

    fn settle(&self) {
        thread::sleep(Duration::from_millis(self.settings.action_delay_ms));
    }

    fn screen_size(&mut self) -> DeviceResult<(i32, i32)> {
        if let Some(size) = self.screen {
            return Ok(size);
        }
        let out = self.shell(&["wm", "size"])?.text();
        let size = out
            .lines()
            .rev()
            .filter_map(|l| l.rsplit(' ').next())
            .filter_map(|dims| dims.split_once('x'))
            .find_map(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
            .ok_or_else(|| DeviceError::Emulator(format!("unexpected `wm size` output: {}", out.trim())))?;
        self.screen = Some(size);
        Ok(size)
    }

    fn swipe(&self, from: (i32, i32), to: (i32, i32), duration_ms: u32) -> DeviceResult<AdbOutput> {
        self.shell(&[
            "input",
            "swipe",
            &from.0.to_string(),
            &from.1.to_string(),
            &to.0.to_string(),
            &to.1.to_string(),
            &duration_ms.to_string(),
        ])
    }

    fn keyevent(&self, code: u32) -> DeviceResult<AdbOutput> {
        self.shell(&["input", "keyevent", &code.to_string()])
    }

    /// Swipe endpoints that move content in `direction` within `area`
    fn swipe_points(area: Bounds, direction: Direction) -> ((i32, i32), (i32, i32)) {
        let (cx, cy) = area.center();
        let (dx, dy) = (area.width() / 4, area.height() / 4);
        match direction {
            // Scrolling up reveals content above, so the finger moves down
            Direction::Up => ((cx, cy - dy), (cx, cy + dy)),
            Direction::Down => ((cx, cy + dy), (cx, cy - dy)),
            Direction::Left => ((cx - dx, cy), (cx + dx, cy)),
            Direction::Right => ((cx + dx, cy), (cx - dx, cy)),
        }
    }

    fn perform(&mut self, action: &Action) -> DeviceResult<AdbOutput> {
        let target = || {
            action.target.as_ref().map(|k| k.bounds).ok_or_else(|| DeviceError::ActionExecution {
                action: action.to_string(),
                reason: "action has no target element".to_string(),
            })
        };

        match &action.kind {
            ActionKind::Tap => {
                let (x, y) = target()?.center();
                self.shell(&["input", "tap", &x.to_string(), &y.to_string()])
            }
            ActionKind::LongPress => {
                let c = target()?.center();
                self.swipe(c, c, LONG_PRESS_MS)
            }
            ActionKind::Scroll(direction) => {
                let (from, to) = Self::swipe_points(target()?, *direction);
                self.swipe(from, to, SWIPE_MS)
            }
            ActionKind::TextInput(None) => Err(DeviceError::ActionExecution {
                action: action.to_string(),
                reason: "no text value was synthesized".to_string(),
            }),
            ActionKind::TextInput(Some(text)) => {
                let (x, y) = target()?.center();
                self.shell(&["input", "tap", &x.to_string(), &y.to_string()])?;
                thread::sleep(Duration::from_millis(100));
                let quoted = format!("'{}'", text.replace(' ', "%s").replace('\'', r"'\''"));
                self.shell(&["input", "text", &quoted])
            }
            ActionKind::Global(global) => match global {
                GlobalAction::Back => self.keyevent(4),
                GlobalAction::Enter => self.keyevent(66),
                GlobalAction::Delete => self.keyevent(67),
                GlobalAction::Home => self.keyevent(3),
                GlobalAction::Swipe(direction) => {
                    let (w, h) = self.screen_size()?;
                    let (from, to) = Self::swipe_points(Bounds::new(0, 0, w, h), *direction);
                    self.swipe(from, to, SWIPE_MS)
                }
                GlobalAction::Rotate(orientation) => {
                    self.shell(&["settings", "put", "system", "accelerometer_rotation", "0"])?;
                    let rotation = match orientation {
                        Orientation::Portrait => "0",
                        Orientation::Landscape => "1",
                    };
                    self.shell(&["settings", "put", "system", "user_rotation", rotation])
                }
            },
        }
    }

    fn dump_hierarchy(&self) -> DeviceResult<String> {
        let out = self.shell(&["uiautomator", "dump", DUMP_PATH])?;
        if !out.success {
            return Err(DeviceError::Enumeration(format!("uiautomator dump failed: {}", out.stderr.trim())));
        }
        Ok(self.adb(&["exec-out", "cat", DUMP_PATH])?.text())
    }

    fn screencap(&self) -> DeviceResult<Screenshot> {
        let out = self.adb(&["exec-out", "screencap", "-p"])?;
        if !out.success || out.stdout.is_empty() {
            return Err(DeviceError::Emulator(format!("screencap failed: {}", out.stderr.trim())));
        }
        Screenshot::from_png(out.stdout)
    }

    fn probe_crash(&self) -> DeviceResult<Option<String>> {
        let log = self.adb(&["logcat", "-d", "AndroidRuntime:E", "*:S"])?.text();
        let crash = parse_crash(&log);
        if crash.is_some() {
            self.adb(&["logcat", "-c"])?;
        }
        Ok(crash)
    }
}

impl Device for AdbDevice {
    fn execute(&mut self, action: &Action) -> DeviceResult<UiState> {
        let out = match self.perform(action) {
            Ok(out) => out,
            Err(DeviceError::Emulator(reason)) => {
                return Err(DeviceError::ActionExecution {
                    action: action.to_string(),
                    reason,
                });
            }
            Err(e) => return Err(e),
        };
        if !out.success {
            return Err(DeviceError::ActionExecution {
                action: action.to_string(),
                reason: out.stderr.trim().to_string(),
            });
        }
        self.settle();
        self.capture()
    }

    fn capture(&mut self) -> DeviceResult<UiState> {
        let crash = self.probe_crash()?;
        let xml = self.dump_hierarchy()?;
        let elements = parse_hierarchy(&xml)?;
        let screenshot = self.screencap()?;

        let focus = self.shell(&["dumpsys", "window"])?.text();
        let (package, activity) = match parse_focus(&focus) {
            Some((p, a)) => (p, Some(a)),
            None => (self.package.clone(), None),
        };
        if let Some(sig) = &crash {
            warn!(crash = %sig, "app crash detected");
        }

        Ok(UiState {
            elements,
            screenshot,
            package,
            activity,
            crash,
        })
    }

    fn snapshot(&mut self) -> DeviceResult<SnapshotHandle> {
        self.next_snapshot += 1;
        let name = format!("droid-repro-{}-{}", std::process::id(), self.next_snapshot);
        self.emu(&["avd", "snapshot", "save", &name])?;
        debug!(snapshot = %name, "snapshot saved");
        Ok(SnapshotHandle(name))
    }

    fn restore(&mut self, handle: &SnapshotHandle) -> DeviceResult<()> {
        self.emu(&["avd", "snapshot", "load", &handle.0])?;
        self.settle();

        let shot = self.screencap()?;
        let rgb = image::load_from_memory(&shot.png)?.to_rgb8();
        let all_black = (0..rgb.height())
            .step_by(BLACK_SAMPLE_STEP as usize)
            .flat_map(|y| (0..rgb.width()).step_by(BLACK_SAMPLE_STEP as usize).map(move |x| (x, y)))
            .all(|(x, y)| rgb.get_pixel(x, y).0 == [0, 0, 0]);
        if all_black {
            return Err(DeviceError::Emulator(format!("snapshot {} loaded a black screen", handle)));
        }
        debug!(snapshot = %handle, "snapshot restored");
        Ok(())
    }

    fn release(&mut self, handle: &SnapshotHandle) -> DeviceResult<()> {
        self.emu(&["avd", "snapshot", "delete", &handle.0])?;
        debug!(snapshot = %handle, "snapshot deleted");
        Ok(())
    }

    fn relaunch(&mut self) -> DeviceResult<()> {
        let out = self.shell(&["am", "force-stop", self.package.as_str()])?;
        if !out.success {
            return Err(DeviceError::Emulator(format!("failed to stop {}: {}", self.package, out.stderr.trim())));
        }
        let activity = self.activity.clone();
        self.launch(activity.as_deref())?;
        debug!(package = %self.package, "app relaunched");
        Ok(())
    }

    fn source_type(&self) -> String {
        format!("adb:{}", self.settings.serial)
    }
}
