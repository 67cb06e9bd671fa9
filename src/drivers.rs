use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Hardware capability a device is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Camera,
    Mount,
    Focuser,
    FilterWheel,
    Gps,
    Rotator,
    GuideOutput,
    Thermometer,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 8] = [
        DeviceKind::Camera,
        DeviceKind::Mount,
        DeviceKind::Focuser,
        DeviceKind::FilterWheel,
        DeviceKind::Gps,
        DeviceKind::Rotator,
        DeviceKind::GuideOutput,
        DeviceKind::Thermometer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Mount => "mount",
            DeviceKind::Focuser => "focuser",
            DeviceKind::FilterWheel => "filter wheel",
            DeviceKind::Gps => "gps",
            DeviceKind::Rotator => "rotator",
            DeviceKind::GuideOutput => "guide output",
            DeviceKind::Thermometer => "thermometer",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps driver executable names (`DRIVER_EXEC`) to the device kind the
/// router should construct for them. Validated for duplicates at build
/// time so one executable can never classify two ways.
#[derive(Debug, Clone, Default)]
pub struct DriverTable {
    by_exec: HashMap<&'static str, DeviceKind>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver executable. Fails if the executable is already mapped.
    pub fn insert(&mut self, exec: &'static str, kind: DeviceKind) -> Result<()> {
        if self.by_exec.insert(exec, kind).is_some() {
            return Err(Error::DuplicateDriver { exec: exec.to_string() });
        }
        Ok(())
    }

    /// Kind for the given driver executable, if known.
    pub fn classify(&self, exec: &str) -> Option<DeviceKind> {
        self.by_exec.get(exec).copied()
    }

    pub fn len(&self) -> usize {
        self.by_exec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_exec.is_empty()
    }

    /// The built-in table covering the common INDI driver set.
    pub fn builtin() -> &'static DriverTable {
        static TABLE: OnceLock<DriverTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            let mut table = DriverTable::new();
            let entries: &[(&[&'static str], DeviceKind)] = &[
                (
                    &[
                        "indi_asi_ccd",
                        "indi_asi_single_ccd",
                        "indi_atik_ccd",
                        "indi_canon_ccd",
                        "indi_gphoto_ccd",
                        "indi_nikon_ccd",
                        "indi_playerone_ccd",
                        "indi_qhy_ccd",
                        "indi_sbig_ccd",
                        "indi_simulator_ccd",
                        "indi_simulator_guide",
                        "indi_sony_ccd",
                        "indi_svbony_ccd",
                        "indi_sx_ccd",
                        "indi_toupcam_ccd",
                        "indi_v4l2_ccd",
                    ],
                    DeviceKind::Camera,
                ),
                (
                    &[
                        "indi_azgti_telescope",
                        "indi_celestron_aux",
                        "indi_celestron_gps",
                        "indi_eqmod_telescope",
                        "indi_ieq_telescope",
                        "indi_ioptronv3_telescope",
                        "indi_lx200am5",
                        "indi_lx200basic",
                        "indi_lx200gotonova",
                        "indi_lx200gps",
                        "indi_lx200zeq25",
                        "indi_paramount_telescope",
                        "indi_simulator_telescope",
                        "indi_skywatcherAltAzMount",
                        "indi_synscan_telescope",
                        "indi_temma_telescope",
                    ],
                    DeviceKind::Mount,
                ),
                (
                    &[
                        "indi_aaf2_focus",
                        "indi_asi_focuser",
                        "indi_celestron_sct_focus",
                        "indi_deepskydad_af1_focus",
                        "indi_dmfc_focus",
                        "indi_esatto_focus",
                        "indi_moonlite_focus",
                        "indi_myfocuserpro2_focus",
                        "indi_pegasus_focuscube",
                        "indi_sestosenso2_focus",
                        "indi_simulator_focus",
                    ],
                    DeviceKind::Focuser,
                ),
                (
                    &[
                        "indi_asi_wheel",
                        "indi_manual_wheel",
                        "indi_playerone_wheel",
                        "indi_qhycfw1_wheel",
                        "indi_qhycfw2_wheel",
                        "indi_simulator_wheel",
                        "indi_sx_wheel",
                        "indi_xagyl_wheel",
                    ],
                    DeviceKind::FilterWheel,
                ),
                (
                    &["indi_gpsd", "indi_gpsnmea", "indi_simulator_gps"],
                    DeviceKind::Gps,
                ),
                (
                    &[
                        "indi_falcon_rotator",
                        "indi_nframe_rotator",
                        "indi_simulator_rotator",
                        "indi_wanderer_rotator_lite",
                    ],
                    DeviceKind::Rotator,
                ),
            ];
            for (execs, kind) in entries {
                for exec in *execs {
                    // Statically curated, duplicates would be a bug in the table itself.
                    if let Err(err) = table.insert(exec, *kind) {
                        panic!("builtin driver table: {err}");
                    }
                }
            }
            table
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_classifies_known_executables() {
        let table = DriverTable::builtin();
        assert_eq!(table.classify("indi_asi_ccd"), Some(DeviceKind::Camera));
        assert_eq!(
            table.classify("indi_simulator_telescope"),
            Some(DeviceKind::Mount)
        );
        assert_eq!(table.classify("indi_moonlite_focus"), Some(DeviceKind::Focuser));
        assert_eq!(table.classify("indi_unknown_gadget"), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut table = DriverTable::new();
        table.insert("indi_asi_ccd", DeviceKind::Camera).unwrap();
        let err = table.insert("indi_asi_ccd", DeviceKind::Mount).unwrap_err();
        assert!(matches!(err, Error::DuplicateDriver { .. }));
    }
}
