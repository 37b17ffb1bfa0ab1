/// Host information sent as the `system` section: operating system, CPU,
/// scheduler counters, memory and the storage holding the data directory.
///
/// Everything is read from procfs and sysfs, so only Linux hosts report more
/// than the OS basics. Each section is best effort: a section that cannot be
/// read is logged and sent as null.
use crate::executor::{OnError, QueryExecutor};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Tick rate of the counters in /proc/stat, fixed by the kernel ABI.
const USER_HZ: u64 = 100;

/// Fields of a sysfs block device `stat` file, in file order.
const DISK_STAT_FIELDS: usize = 11;

#[derive(Debug)]
pub enum SystemInfoError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        detail: String,
    },
    #[cfg(target_os = "linux")]
    Statvfs {
        path: PathBuf,
        source: nix::errno::Errno,
    },
    #[cfg(not(target_os = "linux"))]
    Unsupported,
}

impl std::fmt::Display for SystemInfoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemInfoError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            SystemInfoError::Parse { path, detail } => {
                write!(f, "unexpected contents in {}: {}", path.display(), detail)
            }
            #[cfg(target_os = "linux")]
            SystemInfoError::Statvfs { path, source } => {
                write!(f, "statvfs({}) failed: {}", path.display(), source)
            }
            #[cfg(not(target_os = "linux"))]
            SystemInfoError::Unsupported => write!(f, "not supported on this platform"),
        }
    }
}

impl std::error::Error for SystemInfoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SystemInfoError::Read { source, .. } => Some(source),
            #[cfg(target_os = "linux")]
            SystemInfoError::Statvfs { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OsInfo {
    pub system: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_version: Option<String>,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_model: Option<String>,
}

/// Aggregate CPU time since boot, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuBusyTimes {
    pub user_msec: u64,
    pub nice_msec: u64,
    pub system_msec: u64,
    pub idle_msec: u64,
    pub iowait_msec: u64,
    pub irq_msec: u64,
    pub softirq_msec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steal_msec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_msec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_nice_msec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuHardware {
    pub model: Option<String>,
    pub cache_size: Option<String>,
    pub speed_mhz: Option<f64>,
    pub sockets: u32,
    pub cores_per_socket: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    pub busy_times: CpuBusyTimes,
    pub hardware: CpuHardware,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scheduler {
    pub interrupts: u64,
    pub context_switches: u64,
    pub procs_running: u64,
    pub procs_blocked: u64,
    pub procs_created: u64,
    pub loadavg_1min: f64,
    pub loadavg_5min: f64,
    pub loadavg_15min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskStats {
    pub rd_ios: u64,
    pub rd_merges: u64,
    pub rd_sectors: u64,
    pub rd_ticks: u64,
    pub wr_ios: u64,
    pub wr_merges: u64,
    pub wr_sectors: u64,
    pub wr_ticks: u64,
    pub ios_in_prog: u64,
    pub tot_ticks: u64,
    pub rq_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Storage {
    pub name: String,
    pub path: String,
    pub mountpoint: String,
    pub bytes_total: u64,
    pub bytes_available: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perfdata: Option<DiskStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    pub total_bytes: u64,
    pub buffers_bytes: u64,
    pub pagecache_bytes: u64,
    pub free_bytes: u64,
    pub applications_bytes: u64,
    pub dirty_bytes: u64,
    pub writeback_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

/// The `system` section of the submitted data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub os: Option<OsInfo>,
    pub cpu: Option<CpuInfo>,
    pub scheduler: Option<Scheduler>,
    pub storage: Option<Vec<Storage>>,
    pub memory: Option<Memory>,
}

fn parse_error(path: &Path, detail: impl Into<String>) -> SystemInfoError {
    SystemInfoError::Parse {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

/// `key: value` pairs of a procfs file, whitespace trimmed.
fn key_values(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Busy times from the aggregate `cpu ` line of /proc/stat.
pub fn parse_cpu_times(procstat: &str) -> Result<CpuBusyTimes, String> {
    let line = procstat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or("no aggregate cpu line")?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>().map_err(|_| format!("bad cpu counter {v:?}")))
        .collect::<Result<_, _>>()?;
    if ticks.len() < 7 {
        return Err(format!("expected at least 7 cpu counters, found {}", ticks.len()));
    }
    let msec = |i: usize| ticks.get(i).map(|t| t * (1000 / USER_HZ));
    Ok(CpuBusyTimes {
        user_msec: ticks[0] * (1000 / USER_HZ),
        nice_msec: ticks[1] * (1000 / USER_HZ),
        system_msec: ticks[2] * (1000 / USER_HZ),
        idle_msec: ticks[3] * (1000 / USER_HZ),
        iowait_msec: ticks[4] * (1000 / USER_HZ),
        irq_msec: ticks[5] * (1000 / USER_HZ),
        softirq_msec: ticks[6] * (1000 / USER_HZ),
        steal_msec: msec(7),
        guest_msec: msec(8),
        guest_nice_msec: msec(9),
    })
}

/// Hardware description from /proc/cpuinfo. Socket and core counts fall
/// back to the processor count, then to one.
pub fn parse_cpuinfo(cpuinfo: &str) -> CpuHardware {
    let collapse = |v: &str| v.split_whitespace().collect::<Vec<_>>().join(" ");
    let first = |key: &str| {
        key_values(cpuinfo)
            .find(|(k, _)| *k == key)
            .map(|(_, v)| collapse(v))
    };
    let max_id = |key: &str| {
        key_values(cpuinfo)
            .filter(|(k, _)| *k == key)
            .filter_map(|(_, v)| v.parse::<u32>().ok())
            .max()
    };

    let speed_mhz = first("cpu MHz")
        .and_then(|v| v.parse::<f64>().ok())
        .map(|mhz| (mhz * 100.0).round() / 100.0);
    let cores_per_socket = first("cpu cores")
        .and_then(|v| v.parse().ok())
        .or_else(|| max_id("processor").map(|id| id + 1))
        .unwrap_or(1);

    CpuHardware {
        model: first("model name"),
        cache_size: first("cache size"),
        speed_mhz,
        sockets: max_id("physical id").map(|id| id + 1).unwrap_or(1),
        cores_per_socket,
    }
}

/// Scheduler counters from /proc/stat and the load averages from
/// /proc/loadavg.
pub fn parse_scheduler(procstat: &str, loadavg: &str) -> Result<Scheduler, String> {
    let counter = |name: &str| -> Result<u64, String> {
        procstat
            .lines()
            .map(|l| l.split_whitespace())
            .find_map(|mut parts| {
                (parts.next() == Some(name)).then(|| parts.next().and_then(|v| v.parse().ok()))
            })
            .flatten()
            .ok_or_else(|| format!("missing {name} counter"))
    };
    let loads: Vec<f64> = loadavg
        .split_whitespace()
        .take(3)
        .map(|v| v.parse::<f64>().map_err(|_| format!("bad load average {v:?}")))
        .collect::<Result<_, _>>()?;
    let [one, five, fifteen] = loads[..] else {
        return Err("expected three load averages".to_string());
    };

    Ok(Scheduler {
        interrupts: counter("intr")?,
        context_switches: counter("ctxt")?,
        procs_running: counter("procs_running")?,
        procs_blocked: counter("procs_blocked")?,
        procs_created: counter("processes")?,
        loadavg_1min: one,
        loadavg_5min: five,
        loadavg_15min: fifteen,
    })
}

/// Memory usage from /proc/meminfo, in bytes. Fields a kernel does not
/// report (containers, for one) count as zero.
pub fn parse_meminfo(meminfo: &str) -> Memory {
    let kib = |key: &str| {
        key_values(meminfo)
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };
    let total = kib("MemTotal");
    let free = kib("MemFree");
    let buffers = kib("Buffers");
    let cached = kib("Cached");
    Memory {
        total_bytes: total,
        buffers_bytes: buffers,
        pagecache_bytes: cached,
        free_bytes: free,
        applications_bytes: total.saturating_sub(free + buffers + cached),
        dirty_bytes: kib("Dirty"),
        writeback_bytes: kib("Writeback"),
        swap_total_bytes: kib("SwapTotal"),
        swap_free_bytes: kib("SwapFree"),
    }
}

/// Counters of a sysfs block device `stat` file. Newer kernels append
/// fields; only the first eleven are reported.
pub fn parse_disk_stats(stat: &str) -> Option<DiskStats> {
    let values: Vec<u64> = stat
        .split_whitespace()
        .take(DISK_STAT_FIELDS)
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    let [rd_ios, rd_merges, rd_sectors, rd_ticks, wr_ios, wr_merges, wr_sectors, wr_ticks, ios_in_prog, tot_ticks, rq_ticks] =
        values[..]
    else {
        return None;
    };
    Some(DiskStats {
        rd_ios,
        rd_merges,
        rd_sectors,
        rd_ticks,
        wr_ios,
        wr_merges,
        wr_sectors,
        wr_ticks,
        ios_in_prog,
        tot_ticks,
        rq_ticks,
    })
}

/// Value of one `KEY=value` line of os-release, unquoted.
fn os_release_value(text: &str, key: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// Name reported as `system`, in the spelling the endpoint expects.
fn system_name() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Darwin".to_string(),
        other => other.to_string(),
    }
}

/// Reads host information below a filesystem root (`/` outside tests).
#[derive(Debug, Clone)]
pub struct Host {
    root: PathBuf,
}

impl Default for Host {
    fn default() -> Self {
        Self::at("/")
    }
}

impl Host {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn read(&self, relative: &str) -> Result<(PathBuf, String), SystemInfoError> {
        let path = self.path(relative);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok((path, text)),
            Err(source) => Err(SystemInfoError::Read { path, source }),
        }
    }

    /// First line of a file, if it exists and is not blank.
    fn read_line(&self, relative: &str) -> Option<String> {
        self.read(relative)
            .ok()
            .and_then(|(_, text)| text.lines().next().map(|l| l.trim().to_string()))
            .filter(|l| !l.is_empty())
    }

    pub fn os(&self) -> OsInfo {
        let release = self.read("etc/os-release").ok().map(|(_, text)| text);
        let vendor = self.read_line("sys/devices/virtual/dmi/id/sys_vendor");
        let model = self.read_line("sys/devices/virtual/dmi/id/product_name");
        OsInfo {
            system: system_name(),
            distribution: release.as_deref().and_then(|r| os_release_value(r, "NAME")),
            distribution_version: release
                .as_deref()
                .and_then(|r| os_release_value(r, "VERSION_ID")),
            architecture: std::env::consts::ARCH.to_string(),
            kernel_version: self.read_line("proc/sys/kernel/osrelease"),
            server_model: vendor.zip(model).map(|(v, m)| format!("{v} {m}")),
        }
    }

    pub fn cpu(&self) -> Result<CpuInfo, SystemInfoError> {
        let (stat_path, procstat) = self.read("proc/stat")?;
        let (_, cpuinfo) = self.read("proc/cpuinfo")?;
        Ok(CpuInfo {
            busy_times: parse_cpu_times(&procstat).map_err(|e| parse_error(&stat_path, e))?,
            hardware: parse_cpuinfo(&cpuinfo),
        })
    }

    pub fn scheduler(&self) -> Result<Scheduler, SystemInfoError> {
        let (stat_path, procstat) = self.read("proc/stat")?;
        let (_, loadavg) = self.read("proc/loadavg")?;
        parse_scheduler(&procstat, &loadavg).map_err(|e| parse_error(&stat_path, e))
    }

    pub fn memory(&self) -> Result<Memory, SystemInfoError> {
        let (_, meminfo) = self.read("proc/meminfo")?;
        Ok(parse_meminfo(&meminfo))
    }

    /// Capacity, I/O counters and hardware of the device holding
    /// `data_directory`.
    #[cfg(target_os = "linux")]
    pub fn storage(&self, data_directory: &Path) -> Result<Storage, SystemInfoError> {
        use std::os::unix::fs::MetadataExt;

        let vfs = nix::sys::statvfs::statvfs(data_directory).map_err(|source| {
            SystemInfoError::Statvfs {
                path: data_directory.to_path_buf(),
                source,
            }
        })?;
        let fragment = vfs.fragment_size() as u64;
        let dev = std::fs::metadata(data_directory)
            .map_err(|source| SystemInfoError::Read {
                path: data_directory.to_path_buf(),
                source,
            })?
            .dev();
        let device = format!(
            "sys/dev/block/{}:{}",
            nix::sys::stat::major(dev),
            nix::sys::stat::minor(dev)
        );

        let perfdata = self
            .read(&format!("{device}/stat"))
            .ok()
            .and_then(|(_, text)| parse_disk_stats(&text));
        let vendor = self.read_line(&format!("{device}/device/vendor"));
        let model = self.read_line(&format!("{device}/device/model"));

        Ok(Storage {
            name: "PGDATA directory".to_string(),
            path: data_directory.display().to_string(),
            mountpoint: mount_point(data_directory).display().to_string(),
            bytes_total: fragment * vfs.blocks() as u64,
            bytes_available: fragment * vfs.blocks_available() as u64,
            perfdata,
            hardware: vendor.zip(model).map(|(v, m)| format!("{v} {m}")),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn storage(&self, _data_directory: &Path) -> Result<Storage, SystemInfoError> {
        Err(SystemInfoError::Unsupported)
    }
}

/// Closest ancestor of `path` on which a filesystem is mounted.
#[cfg(target_os = "linux")]
fn mount_point(path: &Path) -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    let mut current = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    loop {
        let Some(parent) = current.parent().map(Path::to_path_buf) else {
            return current;
        };
        let same_device = match (std::fs::metadata(&current), std::fs::metadata(&parent)) {
            (Ok(here), Ok(up)) => here.dev() == up.dev() && here.ino() != up.ino(),
            _ => false,
        };
        if !same_device {
            return current;
        }
        current = parent;
    }
}

fn best_effort<T>(section: &'static str, result: Result<T, SystemInfoError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(section, error = %e, "skipping system information section");
            None
        }
    }
}

/// Collect every section. The data directory is asked of the server; when
/// that fails the storage section is skipped.
pub async fn collect_system_info<E: QueryExecutor>(host: &Host, executor: &E) -> SystemInfo {
    let storage = match executor.execute("SHOW data_directory", OnError::Return).await {
        Ok(rows) => rows
            .first()
            .and_then(|row| row.get("data_directory"))
            .map(PathBuf::from)
            .and_then(|dir| best_effort("storage", host.storage(&dir)))
            .map(|storage| vec![storage]),
        Err(e) => {
            tracing::debug!(error = %e, "could not read data_directory, skipping storage");
            None
        }
    };

    SystemInfo {
        os: Some(host.os()),
        cpu: best_effort("cpu", host.cpu()),
        scheduler: best_effort("scheduler", host.scheduler()),
        storage,
        memory: best_effort("memory", host.memory()),
    }
}
