//! Runtime security monitor
//!
//! Looks for an attached debugger, virtualization indicators and running
//! analysis tools. Any single positive detection makes the runtime
//! insecure. Detection never fails the caller: unreadable sources count as
//! "nothing found", and the result is a plain [`RuntimeStatus`] value the
//! caller branches on.

use crate::config::SecurityConfig;
use crate::errors::CustodyError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A single runtime check.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some(evidence)` on a positive detection.
    fn detect(&self) -> Option<String>;
}

/// One positive detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub detector: &'static str,
    pub evidence: String,
}

/// Outcome of a monitor pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Secure,
    Compromised(Vec<Finding>),
}

impl RuntimeStatus {
    pub fn is_secure(&self) -> bool {
        matches!(self, RuntimeStatus::Secure)
    }
}

/// Debugger attachment via `TracerPid` in `/proc/self/status`
pub struct DebuggerDetector {
    status_path: PathBuf,
}

impl DebuggerDetector {
    pub fn new() -> Self {
        Self::with_status_path("/proc/self/status")
    }

    pub fn with_status_path(path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: path.into(),
        }
    }
}

impl Default for DebuggerDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for DebuggerDetector {
    fn name(&self) -> &'static str {
        "debugger"
    }

    fn detect(&self) -> Option<String> {
        let status = fs::read_to_string(&self.status_path).ok()?;
        let tracer = status
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))?
            .trim()
            .parse::<u32>()
            .ok()?;
        (tracer != 0).then(|| format!("tracer pid {}", tracer))
    }
}

/// Hypervisor vendor/model strings in the DMI tables
pub struct VirtualizationDetector {
    dmi_root: PathBuf,
    indicators: Vec<String>,
}

const DMI_FIELDS: [&str; 5] = [
    "sys_vendor",
    "product_name",
    "board_vendor",
    "bios_vendor",
    "chassis_vendor",
];

impl VirtualizationDetector {
    pub fn new(indicators: Vec<String>) -> Self {
        Self::with_dmi_root("/sys/class/dmi/id", indicators)
    }

    pub fn with_dmi_root(root: impl Into<PathBuf>, indicators: Vec<String>) -> Self {
        Self {
            dmi_root: root.into(),
            indicators: indicators.into_iter().map(|i| i.to_lowercase()).collect(),
        }
    }
}

impl Detector for VirtualizationDetector {
    fn name(&self) -> &'static str {
        "virtualization"
    }

    fn detect(&self) -> Option<String> {
        DMI_FIELDS.iter().find_map(|field| {
            let value = fs::read_to_string(self.dmi_root.join(field)).ok()?;
            let value = value.trim().to_lowercase();
            self.indicators
                .iter()
                .find(|indicator| value.contains(indicator.as_str()))
                .map(|indicator| format!("{} matches {}", field, indicator))
        })
    }
}

/// Known analysis tools among running processes
pub struct AnalysisToolDetector {
    proc_root: PathBuf,
    tools: Vec<String>,
}

impl AnalysisToolDetector {
    pub fn new(tools: Vec<String>) -> Self {
        Self::with_proc_root("/proc", tools)
    }

    pub fn with_proc_root(root: impl Into<PathBuf>, tools: Vec<String>) -> Self {
        Self {
            proc_root: root.into(),
            tools: tools.into_iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    fn process_name(dir: &Path) -> Option<String> {
        fs::read_to_string(dir.join("comm"))
            .ok()
            .map(|comm| comm.trim().to_lowercase())
    }
}

impl Detector for AnalysisToolDetector {
    fn name(&self) -> &'static str {
        "analysis-tool"
    }

    fn detect(&self) -> Option<String> {
        let entries = fs::read_dir(&self.proc_root).ok()?;
        entries.flatten().find_map(|entry| {
            let file_name = entry.file_name();
            let pid = file_name.to_str()?;
            if !pid.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let name = Self::process_name(&entry.path())?;
            self.tools
                .iter()
                .any(|tool| *tool == name)
                .then(|| format!("process {} ({})", name, pid))
        })
    }
}

/// Aggregates detectors into a single secure/insecure answer.
pub struct RuntimeMonitor {
    detectors: Vec<Box<dyn Detector>>,
}

impl RuntimeMonitor {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Debugger, virtualization and analysis-tool detectors from config
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(vec![
            Box::new(DebuggerDetector::new()),
            Box::new(VirtualizationDetector::new(config.vm_indicators.clone())),
            Box::new(AnalysisToolDetector::new(config.analysis_tools.clone())),
        ])
    }

    /// Run every detector.
    pub fn assess(&self) -> RuntimeStatus {
        let findings: Vec<Finding> = self
            .detectors
            .iter()
            .filter_map(|detector| {
                detector.detect().map(|evidence| Finding {
                    detector: detector.name(),
                    evidence,
                })
            })
            .collect();

        if findings.is_empty() {
            debug!("Runtime checks passed ({} detectors)", self.detectors.len());
            RuntimeStatus::Secure
        } else {
            for finding in &findings {
                warn!(detector = finding.detector, "Runtime check flagged the environment");
            }
            RuntimeStatus::Compromised(findings)
        }
    }

    pub fn is_runtime_secure(&self) -> bool {
        self.assess().is_secure()
    }
}

/// Replace an internal failure with a fixed, detail-free error.
pub fn obfuscate<E: std::fmt::Display>(_err: E) -> CustodyError {
    CustodyError::Obscured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GENERIC_FAILURE_MESSAGE;
    use tempfile::tempdir;

    struct Always(&'static str);

    impl Detector for Always {
        fn name(&self) -> &'static str {
            self.0
        }

        fn detect(&self) -> Option<String> {
            Some("forced".to_string())
        }
    }

    struct Never;

    impl Detector for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn detect(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_any_detection_is_insecure() {
        let monitor = RuntimeMonitor::new(vec![Box::new(Never), Box::new(Always("forced"))]);
        match monitor.assess() {
            RuntimeStatus::Compromised(findings) => {
                assert_eq!(findings.len(), 1);
                assert_eq!(findings[0].detector, "forced");
            }
            RuntimeStatus::Secure => panic!("expected compromised"),
        }
        assert!(!monitor.is_runtime_secure());
    }

    #[test]
    fn test_no_detection_is_secure() {
        assert!(RuntimeMonitor::new(vec![Box::new(Never)]).is_runtime_secure());
        assert!(RuntimeMonitor::new(vec![]).is_runtime_secure());
    }

    #[test]
    fn test_debugger_tracer_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status");

        fs::write(&path, "Name:\tkeyguard\nTracerPid:\t0\n").unwrap();
        assert!(DebuggerDetector::with_status_path(&path).detect().is_none());

        fs::write(&path, "Name:\tkeyguard\nTracerPid:\t4242\n").unwrap();
        assert_eq!(
            DebuggerDetector::with_status_path(&path).detect(),
            Some("tracer pid 4242".to_string())
        );
    }

    #[test]
    fn test_missing_sources_are_not_detections() {
        assert!(DebuggerDetector::with_status_path("/nonexistent/status").detect().is_none());
        assert!(VirtualizationDetector::with_dmi_root("/nonexistent", vec!["qemu".into()])
            .detect()
            .is_none());
        assert!(AnalysisToolDetector::with_proc_root("/nonexistent", vec!["gdb".into()])
            .detect()
            .is_none());
    }

    #[test]
    fn test_virtualization_vendor_match() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sys_vendor"), "Dell Inc.\n").unwrap();
        let detector = VirtualizationDetector::with_dmi_root(dir.path(), vec!["VMware".into()]);
        assert!(detector.detect().is_none());

        fs::write(dir.path().join("product_name"), "VMware Virtual Platform\n").unwrap();
        assert!(detector.detect().unwrap().contains("product_name"));
    }

    #[test]
    fn test_analysis_tool_process() {
        let dir = tempdir().unwrap();
        let proc1 = dir.path().join("100");
        fs::create_dir(&proc1).unwrap();
        fs::write(proc1.join("comm"), "bash\n").unwrap();
        fs::create_dir(dir.path().join("self")).unwrap();

        let detector = AnalysisToolDetector::with_proc_root(dir.path(), vec!["gdb".into()]);
        assert!(detector.detect().is_none());

        let proc2 = dir.path().join("200");
        fs::create_dir(&proc2).unwrap();
        fs::write(proc2.join("comm"), "gdb\n").unwrap();
        assert_eq!(detector.detect(), Some("process gdb (200)".to_string()));
    }

    #[test]
    fn test_obfuscate_drops_detail() {
        let err = obfuscate("padding error at offset 48 with key 0xdeadbeef");
        assert!(matches!(err, CustodyError::Obscured));
        assert_eq!(err.to_string(), GENERIC_FAILURE_MESSAGE);
    }
}
