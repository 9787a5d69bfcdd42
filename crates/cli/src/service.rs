//! Background tracking service
//!
//! Wires the pieces together: one receiver thread drains the ingestion
//! pipe and is the sole writer into the per-site tables; the scheduler
//! thread runs periodic flush and consolidation per site. Every failure is
//! logged and retried on the next cycle; none aborts the service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use urltrack_core::{sanitize_site_id, AddOutcome, Site, SiteOptions};
use urltrack_formats::read_fprints;
use urltrack_pipe::{RawUrlEvent, UrlPipeReceiver};

use crate::config::{ServiceConfig, SiteConfig};

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// All per-site state plus the service configuration.
pub struct Service {
    config: ServiceConfig,
    sites: HashMap<u32, Arc<SiteState>>,
    shutdown: Arc<AtomicBool>,
}

struct SiteState {
    config: SiteConfig,
    site: Site,
}

impl Service {
    /// Open every configured site under the data directory.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        let now = unix_now();
        let mut sites = HashMap::new();
        for site_config in &config.sites {
            let dir = config.data_dir.join(sanitize_site_id(&site_config.name));
            let options = SiteOptions {
                table_capacity: site_config.table_capacity,
                max_retained: site_config.max_retained,
                max_temp_bytes: site_config.max_temp_bytes,
                keep_after_flush: site_config.keep_after_flush,
            };
            let site = Site::open(&dir, options, now)
                .with_context(|| format!("Failed to open site {}", site_config.name))?;
            info!(site = %site_config.name, dir = %dir.display(), "opened site");
            sites.insert(
                site_config.id,
                Arc::new(SiteState {
                    config: site_config.clone(),
                    site,
                }),
            );
        }
        Ok(Self {
            config,
            sites,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle returned to callers that want to stop a running service.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Route one batch of raw events into the per-site tables.
    pub fn dispatch(&self, events: &[RawUrlEvent]) {
        let now = unix_now();
        for event in events {
            let (url, host) = match (event.url(), event.host()) {
                (Ok(url), Ok(host)) => (url, host),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "dropping event with invalid strings");
                    continue;
                }
            };
            let Some(state) = self.sites.get(&event.site_id) else {
                debug!(site_id = event.site_id, url, "event for unknown site");
                continue;
            };
            let outcome = state.site.ingest(
                url,
                host,
                event.content_len,
                event.last_modified_opt(),
                event.file_write_time_opt(),
                now,
            );
            if outcome == AddOutcome::Full {
                warn!(site = %state.config.name, url, "site table full, URL dropped");
            }
        }
    }

    /// Flush every site's in-memory tables to disk.
    pub fn flush_all(&self) {
        let now = unix_now();
        for state in self.sites.values() {
            match state.site.flush(now) {
                Ok(true) => debug!(site = %state.config.name, "flushed"),
                Ok(false) => {}
                Err(e) => error!(site = %state.config.name, error = %e, "flush failed"),
            }
        }
    }

    /// Consolidate every site's snapshot files.
    pub fn consolidate_all(&self) {
        let now = unix_now();
        let cutdown = self.cutdown_time(now);
        for state in self.sites.values() {
            let obsoleted = match &state.config.obsolete_fprints {
                Some(path) if path.exists() => match read_fprints(path) {
                    Ok(mut fps) => {
                        fps.sort_unstable();
                        fps
                    }
                    Err(e) => {
                        warn!(site = %state.config.name, error = %e, "unreadable obsoleted set, ignoring");
                        Vec::new()
                    }
                },
                _ => Vec::new(),
            };

            match state.site.consolidate(&obsoleted, cutdown, now) {
                Ok(outcome) => info!(
                    site = %state.config.name,
                    retained = outcome.retained,
                    dropped_old = outcome.dropped_old,
                    dropped_obsolete = outcome.dropped_obsolete,
                    "consolidated"
                ),
                Err(e) => error!(site = %state.config.name, error = %e, "consolidation failed"),
            }
        }
    }

    fn cutdown_time(&self, now: i64) -> i64 {
        let days = self.config.schedule.retention_days;
        if days == 0 {
            0
        } else {
            now - days as i64 * 86_400
        }
    }

    /// Run the receiver thread and the periodic scheduler until shutdown.
    pub fn run(self) -> Result<()> {
        let mut receiver =
            UrlPipeReceiver::create(&self.config.pipe.path, self.config.pipe.capacity)
                .context("Failed to create ingestion pipe")?;

        let service = Arc::new(self);
        let shutdown = service.shutdown.clone();

        let dispatcher = {
            let service = service.clone();
            std::thread::Builder::new()
                .name("urltrack-recv".to_string())
                .spawn(move || loop {
                    match receiver.recv() {
                        Ok(events) => service.dispatch(&events),
                        Err(e) => {
                            // Receive failures are transient by contract;
                            // back off and keep draining.
                            error!(error = %e, "receive failed");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                })?
        };

        info!(
            sites = service.sites.len(),
            flush_secs = service.config.schedule.flush_interval_secs,
            merge_secs = service.config.schedule.merge_interval_secs,
            "service running"
        );

        let flush_every = Duration::from_secs(service.config.schedule.flush_interval_secs.max(1));
        let merge_every = Duration::from_secs(service.config.schedule.merge_interval_secs.max(1));
        let mut last_flush = std::time::Instant::now();
        let mut last_merge = std::time::Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
            if last_flush.elapsed() >= flush_every {
                service.flush_all();
                last_flush = std::time::Instant::now();
            }
            if last_merge.elapsed() >= merge_every {
                service.consolidate_all();
                last_merge = std::time::Instant::now();
            }
        }

        // Final flush so a clean shutdown loses nothing; the receiver
        // thread is parked in recv and goes down with the process.
        service.flush_all();
        drop(dispatcher);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipeConfig, ScheduleConfig};
    use tempfile::tempdir;
    use urltrack_formats::RecordReader;

    fn test_config(dir: &std::path::Path) -> ServiceConfig {
        ServiceConfig {
            data_dir: dir.to_path_buf(),
            pipe: PipeConfig {
                path: dir.join("pipe"),
                capacity: 64,
            },
            schedule: ScheduleConfig::default(),
            sites: vec![SiteConfig {
                id: 1,
                name: "www.example.com".to_string(),
                table_capacity: 100,
                max_retained: 0,
                max_temp_bytes: None,
                keep_after_flush: false,
                obsolete_fprints: None,
            }],
        }
    }

    fn event(url: &str, site_id: u32) -> RawUrlEvent {
        RawUrlEvent::new(url, "www.example.com", site_id).unwrap()
    }

    #[test]
    fn test_dispatch_flush_consolidate() {
        let dir = tempdir().unwrap();
        let service = Service::open(test_config(dir.path())).unwrap();

        service.dispatch(&[
            event("http://www.example.com/a", 1),
            event("http://www.example.com/b", 1),
            event("http://www.example.com/a", 1),
            event("http://www.example.com/ignored", 99), // unknown site
        ]);
        service.flush_all();
        service.consolidate_all();

        let base = dir.path().join("www_example_com").join("data_base");
        let entries: Vec<_> = RecordReader::open(&base)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        let a = entries
            .iter()
            .find(|(_, r)| r.url == "http://www.example.com/a")
            .unwrap();
        assert_eq!(a.1.count_access, 2);
    }

    #[test]
    fn test_obsoleted_set_applied() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        let obsolete_path = dir.path().join("obsolete_fp");
        config.sites[0].obsolete_fprints = Some(obsolete_path.clone());
        let service = Service::open(config).unwrap();

        service.dispatch(&[
            event("http://www.example.com/keep", 1),
            event("http://www.example.com/drop", 1),
        ]);
        service.flush_all();

        let drop_fp = urltrack_core::url_fingerprint("http://www.example.com/drop");
        urltrack_formats::write_fprints(&obsolete_path, &[drop_fp]).unwrap();

        service.consolidate_all();

        let base = dir.path().join("www_example_com").join("data_base");
        let entries: Vec<_> = RecordReader::open(&base)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.url, "http://www.example.com/keep");
    }
}
