//! 总线状态调和器
//!
//! 纯函数：根据注册表计数和当前驱动状态计算目标状态，再把目标状态转换为有序的驱动调用。
//! 不做 I/O，不加锁。
//!
//! | 活跃客户端 | 活跃 TX 客户端 | 目标 |
//! |-----------|---------------|------|
//! | 0         | -             | 停止并卸载 |
//! | > 0       | 0             | `ListenOnly`，安装并运行 |
//! | > 0       | > 0           | `Normal`（回环时 `NoAck`），安装并运行 |

use canmux_can::{BusMode, FilterConfig, TimingConfig};
use smallvec::SmallVec;

use crate::config::BusSettings;
use crate::registry::RegistrySnapshot;

/// 管理器眼中的驱动状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverState {
    pub installed: bool,
    pub running: bool,
    pub mode: Option<BusMode>,
    pub timing: TimingConfig,
    pub filter: FilterConfig,
}

impl DriverState {
    /// 执行一步驱动调用后的状态
    pub fn after(mut self, step: DriverStep, settings: &BusSettings) -> Self {
        match step {
            DriverStep::Stop => self.running = false,
            DriverStep::Uninstall => {
                self.installed = false;
                self.running = false;
                self.mode = None;
            },
            DriverStep::Install(mode) => {
                self.installed = true;
                self.running = false;
                self.mode = Some(mode);
                self.timing = settings.timing;
                self.filter = settings.filter;
            },
            DriverStep::Start => self.running = true,
        }
        self
    }
}

/// 调和目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatePlan {
    pub target_installed: bool,
    pub target_running: bool,
    pub target_mode: Option<BusMode>,
    /// 仅当当前与目标都已安装时有意义
    pub must_reinstall: bool,
}

/// 驱动调用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStep {
    Stop,
    Uninstall,
    Install(BusMode),
    Start,
}

/// 计算目标状态
pub fn plan(snapshot: &RegistrySnapshot, settings: &BusSettings, current: &DriverState) -> BusStatePlan {
    if snapshot.active == 0 {
        return BusStatePlan {
            target_installed: false,
            target_running: false,
            target_mode: None,
            must_reinstall: false,
        };
    }

    let target_mode = if snapshot.active_tx == 0 {
        BusMode::ListenOnly
    } else if settings.loopback {
        BusMode::NoAck
    } else {
        BusMode::Normal
    };

    let must_reinstall = current.installed
        && (current.mode != Some(target_mode)
            || current.timing != settings.timing
            || current.filter != settings.filter);

    BusStatePlan {
        target_installed: true,
        target_running: true,
        target_mode: Some(target_mode),
        must_reinstall,
    }
}

impl BusStatePlan {
    /// 转换为有序的驱动调用；目标与当前一致时为空
    pub fn steps(&self, current: &DriverState) -> SmallVec<[DriverStep; 4]> {
        let mut steps = SmallVec::new();

        let Some(mode) = self.target_mode.filter(|_| self.target_installed) else {
            if current.running {
                steps.push(DriverStep::Stop);
            }
            if current.installed {
                steps.push(DriverStep::Uninstall);
            }
            return steps;
        };

        let mut running = current.running;
        if current.installed && self.must_reinstall {
            if running {
                steps.push(DriverStep::Stop);
                running = false;
            }
            steps.push(DriverStep::Uninstall);
            steps.push(DriverStep::Install(mode));
        } else if !current.installed {
            running = false;
            steps.push(DriverStep::Install(mode));
        }

        if self.target_running && !running {
            steps.push(DriverStep::Start);
        } else if !self.target_running && running {
            steps.push(DriverStep::Stop);
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(registered: usize, active: usize, active_tx: usize) -> RegistrySnapshot {
        RegistrySnapshot {
            registered,
            active,
            active_tx,
        }
    }

    fn running_in(mode: BusMode) -> DriverState {
        DriverState {
            installed: true,
            running: true,
            mode: Some(mode),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_active_clients_tears_down() {
        let settings = BusSettings::default();
        let current = running_in(BusMode::Normal);
        let plan = plan(&snapshot(3, 0, 0), &settings, &current);
        assert!(!plan.target_installed);
        assert_eq!(
            plan.steps(&current).as_slice(),
            &[DriverStep::Stop, DriverStep::Uninstall]
        );
    }

    #[test]
    fn test_rx_only_clients_listen() {
        let settings = BusSettings::default();
        let current = DriverState::default();
        let plan = plan(&snapshot(1, 1, 0), &settings, &current);
        assert_eq!(plan.target_mode, Some(BusMode::ListenOnly));
        assert_eq!(
            plan.steps(&current).as_slice(),
            &[DriverStep::Install(BusMode::ListenOnly), DriverStep::Start]
        );
    }

    #[test]
    fn test_tx_client_promotes_listen_only() {
        let settings = BusSettings::default();
        let current = running_in(BusMode::ListenOnly);
        let plan = plan(&snapshot(2, 2, 1), &settings, &current);
        assert!(plan.must_reinstall);
        assert_eq!(
            plan.steps(&current).as_slice(),
            &[
                DriverStep::Stop,
                DriverStep::Uninstall,
                DriverStep::Install(BusMode::Normal),
                DriverStep::Start
            ]
        );
    }

    #[test]
    fn test_loopback_selects_no_ack() {
        let settings = BusSettings {
            loopback: true,
            ..Default::default()
        };
        let plan = plan(&snapshot(1, 1, 1), &settings, &DriverState::default());
        assert_eq!(plan.target_mode, Some(BusMode::NoAck));

        // 只有 RX 客户端时回环不生效
        let plan_rx = super::plan(&snapshot(1, 1, 0), &settings, &DriverState::default());
        assert_eq!(plan_rx.target_mode, Some(BusMode::ListenOnly));
    }

    #[test]
    fn test_filter_change_forces_reinstall() {
        let mut settings = BusSettings::default();
        let current = running_in(BusMode::Normal);
        assert!(!plan(&snapshot(1, 1, 1), &settings, &current).must_reinstall);

        settings.filter.acceptance_mask = 0x001F_FFFF;
        assert!(plan(&snapshot(1, 1, 1), &settings, &current).must_reinstall);
    }

    #[test]
    fn test_installed_but_stopped_only_starts() {
        let settings = BusSettings::default();
        let current = DriverState {
            installed: true,
            running: false,
            mode: Some(BusMode::Normal),
            ..Default::default()
        };
        let plan = plan(&snapshot(1, 1, 1), &settings, &current);
        assert_eq!(plan.steps(&current).as_slice(), &[DriverStep::Start]);
    }

    fn arb_mode() -> impl Strategy<Value = Option<BusMode>> {
        prop_oneof![
            Just(None),
            Just(Some(BusMode::Normal)),
            Just(Some(BusMode::NoAck)),
            Just(Some(BusMode::ListenOnly)),
        ]
    }

    prop_compose! {
        fn arb_state()(installed in any::<bool>(), running in any::<bool>(), mode in arb_mode(), masked in any::<bool>()) -> DriverState {
            let mut state = DriverState::default();
            if installed {
                state.installed = true;
                state.running = running;
                state.mode = Some(mode.unwrap_or(BusMode::Normal));
                if masked {
                    state.filter.acceptance_mask = 0x0000_FFFF;
                }
            }
            state
        }
    }

    fn arb_snapshot() -> impl Strategy<Value = RegistrySnapshot> {
        (0usize..8)
            .prop_flat_map(|registered| (Just(registered), 0..=registered))
            .prop_flat_map(|(registered, active)| (Just(registered), Just(active), 0..=active))
            .prop_map(|(registered, active, active_tx)| RegistrySnapshot {
                registered,
                active,
                active_tx,
            })
    }

    proptest! {
        #[test]
        fn applying_steps_reaches_plan_and_is_idempotent(
            snap in arb_snapshot(),
            current in arb_state(),
            loopback in any::<bool>(),
        ) {
            let settings = BusSettings { loopback, ..Default::default() };
            let first = plan(&snap, &settings, &current);
            let steps = first.steps(&current);
            prop_assert!(steps.len() <= 4);

            let reached = steps.iter().fold(current, |state, step| state.after(*step, &settings));
            prop_assert_eq!(reached.installed, first.target_installed);
            prop_assert_eq!(reached.running, first.target_running);
            if first.target_installed {
                prop_assert_eq!(reached.mode, first.target_mode);
                prop_assert_eq!(reached.filter, settings.filter);
            }

            // 第二次调和不产生任何驱动调用
            let second = plan(&snap, &settings, &reached);
            prop_assert!(second.steps(&reached).is_empty());
        }
    }
}
