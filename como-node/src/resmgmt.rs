//! Resource management.
//!
//! The supervisor feeds per-module usage snapshots in every ~50 ms tick.
//! Peaks decay through a low-pass filter; when a resource's summed peak
//! crosses 1.0 the scheduler elects a module to disable, weighting the
//! limiting resource as much as all others together and multiplying by the
//! module's priority. After enough consecutive all-low ticks a random
//! disabled module gets another chance. Decisions never touch stored
//! records, only in-flight aggregation.

use libcomo::logging::{self, Logger};
use rand::Rng;

/// Peak decay per tick.
const DECREMENT: f64 = 0.001;

/// Consecutive all-low ticks before a disabled module is re-enabled.
const ALL_LOW_TICKS: u32 = 200;

/// Scheduler tick period, milliseconds.
pub const TICK_MS: u64 = 50;

#[derive(Debug, Clone, Copy)]
pub struct Resource {
    pub name: &'static str,
    pub upper: f64,
    pub lower: f64,
}

/// One module's view for a tick.
#[derive(Debug, Clone)]
pub struct ModuleUsage {
    pub name: String,
    pub priority: u32,
    pub active: bool,
    /// Usage per resource, same order as the scheduler's resource table.
    pub usage: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    None,
    Disable(Vec<String>),
    Enable(String),
}

pub struct ResourceMgmt {
    resources: Vec<Resource>,
    /// `peaks[resource][module]`, low-pass filtered and normalized to the
    /// resource's upper threshold.
    peaks: Vec<Vec<f64>>,
    consecutive_all_low: u32,
    log: Logger,
}

impl ResourceMgmt {
    /// Standard resource set: global shared memory and export-side memory.
    pub fn standard(pool_size: u64, log: &Logger) -> ResourceMgmt {
        let resources = vec![
            Resource {
                name: "shmem",
                upper: pool_size as f64 * 0.7,
                lower: pool_size as f64 * 0.3,
            },
            Resource {
                name: "exmem",
                upper: (200u64 << 20) as f64,
                lower: (50u64 << 20) as f64,
            },
        ];
        ResourceMgmt::new(resources, log)
    }

    pub fn new(resources: Vec<Resource>, log: &Logger) -> ResourceMgmt {
        let peaks = resources.iter().map(|_| Vec::new()).collect();
        ResourceMgmt {
            resources,
            peaks,
            consecutive_all_low: 0,
            log: log.new(logging::o!("unit" => "resmgmt")),
        }
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// One scheduler tick over the current usage snapshot.
    pub fn schedule<R: Rng>(&mut self, modules: &[ModuleUsage], rng: &mut R) -> Decision {
        for peaks in &mut self.peaks {
            peaks.resize(modules.len(), 0.0);
        }

        // Update low-pass peaks and per-resource totals.
        let mut totals = vec![0.0; self.resources.len()];
        for (r, resource) in self.resources.iter().enumerate() {
            for (m, module) in modules.iter().enumerate() {
                let peak = &mut self.peaks[r][m];

                if !module.active {
                    // Disabled modules drop out of the picture immediately.
                    *peak = 0.0;
                } else {
                    *peak -= DECREMENT;
                }

                let current = module.usage.get(r).copied().unwrap_or(0.0) / resource.upper;
                if current > *peak {
                    *peak = current;
                }

                totals[r] += *peak;
            }
        }

        // Find an overloaded resource and check the all-low condition.
        let mut limiting = None;
        let mut all_low = true;
        for (r, resource) in self.resources.iter().enumerate() {
            if totals[r] * resource.upper > resource.lower {
                all_low = false;
            }
            if totals[r] > 1.0 {
                limiting = Some(r);
                break;
            }
        }

        if let Some(limiting) = limiting {
            self.consecutive_all_low = 0;
            return self.disable(modules, limiting);
        }

        if all_low {
            self.consecutive_all_low += 1;
            if self.consecutive_all_low > ALL_LOW_TICKS {
                self.consecutive_all_low = 0;
                return self.reenable(modules, rng);
            }
        } else {
            self.consecutive_all_low = 0;
        }

        Decision::None
    }

    /// Elects and disables modules until the projected usage of the
    /// limiting resource falls below its upper threshold.
    fn disable(&mut self, modules: &[ModuleUsage], limiting: usize) -> Decision {
        let resource = self.resources[limiting];
        logging::warn!(self.log, "resource overload"; "resource" => resource.name);

        let nres = self.resources.len();
        let mut usage: f64 = modules
            .iter()
            .filter(|m| m.active)
            .map(|m| m.usage.get(limiting).copied().unwrap_or(0.0))
            .sum();

        let mut disabled = Vec::new();
        while usage > resource.upper {
            let mut elected: Option<usize> = None;
            let mut elected_points = 0.0;

            for (m, module) in modules.iter().enumerate() {
                if !module.active || disabled.contains(&module.name) {
                    continue;
                }

                let mut points = 0.0;
                for r in 0..nres {
                    let peak = self.peaks[r][m].max(0.0).min(1.0);
                    // The limiting resource counts as much as the sum of
                    // all other resources.
                    points += if r == limiting {
                        peak * nres as f64
                    } else {
                        peak
                    };
                }
                points *= module.priority as f64;

                if elected.is_none() || points > elected_points {
                    elected = Some(m);
                    elected_points = points;
                }
            }

            let m = match elected {
                Some(m) => m,
                None => break,
            };

            logging::info!(self.log, "module disabled by resource management";
                           "module" => &modules[m].name,
                           "priority" => modules[m].priority,
                           "resource" => resource.name);

            usage -= modules[m].usage.get(limiting).copied().unwrap_or(0.0);
            disabled.push(modules[m].name.clone());
        }

        if disabled.is_empty() {
            logging::warn!(self.log, "no module available for removal");
            return Decision::None;
        }
        Decision::Disable(disabled)
    }

    /// Picks a random disabled module for another chance.
    fn reenable<R: Rng>(&mut self, modules: &[ModuleUsage], rng: &mut R) -> Decision {
        let disabled: Vec<&ModuleUsage> = modules.iter().filter(|m| !m.active).collect();
        if disabled.is_empty() {
            return Decision::None;
        }

        let pick = disabled[rng.gen_range(0..disabled.len())];
        logging::info!(self.log, "module re-enabled by resource management";
                       "module" => &pick.name);
        Decision::Enable(pick.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcomo::logging;
    use rand::rngs::mock::StepRng;

    fn mgmt() -> ResourceMgmt {
        // shmem upper 1000, lower 300; exmem upper 1000, lower 200.
        ResourceMgmt::new(
            vec![
                Resource {
                    name: "shmem",
                    upper: 1000.0,
                    lower: 300.0,
                },
                Resource {
                    name: "exmem",
                    upper: 1000.0,
                    lower: 200.0,
                },
            ],
            &logging::discard(),
        )
    }

    fn usage(name: &str, priority: u32, active: bool, shmem: f64, exmem: f64) -> ModuleUsage {
        ModuleUsage {
            name: name.to_string(),
            priority,
            active,
            usage: vec![shmem, exmem],
        }
    }

    #[test]
    fn test_quiet_system_no_decision() {
        let mut mgmt = mgmt();
        let mut rng = StepRng::new(0, 1);

        let modules = vec![usage("a", 1, true, 100.0, 10.0)];
        assert_eq!(mgmt.schedule(&modules, &mut rng), Decision::None);
    }

    #[test]
    fn test_priority_weighted_election() {
        let mut mgmt = mgmt();
        let mut rng = StepRng::new(0, 1);

        // A drives shared memory over the threshold, but B's priority
        // outweighs its smaller footprint in the election.
        let modules = vec![
            usage("a", 1, true, 900.0, 0.0),
            usage("b", 5, true, 400.0, 0.0),
        ];

        match mgmt.schedule(&modules, &mut rng) {
            Decision::Disable(names) => assert_eq!(names[0], "b"),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_disables_until_below_threshold() {
        let mut state = mgmt();
        let mut rng = StepRng::new(0, 1);

        let modules = vec![
            usage("a", 1, true, 800.0, 0.0),
            usage("b", 1, true, 700.0, 0.0),
            usage("c", 1, true, 100.0, 0.0),
        ];

        match state.schedule(&modules, &mut rng) {
            Decision::Disable(names) => {
                // 1600 total: dropping a alone lands at 800 < 1000.
                assert_eq!(names, vec!["a".to_string()]);
            }
            other => panic!("unexpected decision {:?}", other),
        }

        // One elected module is not always enough: here dropping the
        // heaviest still leaves the resource over its threshold.
        let modules = vec![
            usage("b", 1, true, 900.0, 0.0),
            usage("c", 1, true, 850.0, 0.0),
            usage("d", 1, true, 700.0, 0.0),
        ];
        let mut fresh = mgmt();
        match fresh.schedule(&modules, &mut rng) {
            Decision::Disable(names) => {
                assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_reenable_after_all_low() {
        let mut mgmt = mgmt();
        let mut rng = StepRng::new(0, 1);

        let modules = vec![
            usage("a", 1, true, 10.0, 0.0),
            usage("b", 1, false, 0.0, 0.0),
        ];

        let mut enabled = None;
        for _ in 0..=ALL_LOW_TICKS + 1 {
            if let Decision::Enable(name) = mgmt.schedule(&modules, &mut rng) {
                enabled = Some(name);
                break;
            }
        }
        assert_eq!(enabled.as_deref(), Some("b"));
    }

    #[test]
    fn test_peaks_decay_resets_all_low_counter() {
        let mut mgmt = mgmt();
        let mut rng = StepRng::new(0, 1);

        // Usage above the lower threshold keeps the counter pinned.
        let busy = vec![usage("a", 1, true, 500.0, 0.0), usage("b", 1, false, 0.0, 0.0)];
        for _ in 0..=ALL_LOW_TICKS + 1 {
            assert_eq!(mgmt.schedule(&busy, &mut rng), Decision::None);
        }
    }
}
