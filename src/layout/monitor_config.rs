//! Client Monitor Configuration
//!
//! Validated monitor layouts built from the three client-side sources:
//! the core data block, the TS_UD_CS_MONITOR block, and DISP
//! monitor-layout PDUs. Sanitization and primary election follow
//! [MS-RDPBCGR] 2.2.1.3.6 and [MS-RDPEDISP] 2.2.2.2.1.

use thiserror::Error;

use crate::peer::pdu::{ClientCapabilities, MonitorLayoutPdu};

/// Valid monitor edge lengths.
const MONITOR_MIN_SIZE: u32 = 200;
const MONITOR_MAX_SIZE: u32 = 8192;

/// Monitor configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorConfigError {
    /// Width odd or an edge outside [200, 8192].
    #[error("invalid monitor dimensions: {0}x{1}")]
    InvalidDimensions(u32, u32),

    /// Empty monitor layout.
    #[error("monitor layout contains no monitors")]
    NoMonitors,

    /// Layout exceeds the session monitor cap.
    #[error("monitor count {0} exceeds maximum {1}")]
    TooManyMonitors(usize, u32),

    /// Two monitor rectangles overlap.
    #[error("monitor overlaps other monitor in layout")]
    OverlappingMonitors,

    /// No monitor is anchored at the origin.
    #[error("no suitable primary monitor in monitor layout")]
    NoPrimaryMonitor,
}

/// Result alias for monitor-config construction.
pub type Result<T> = std::result::Result<T, MonitorConfigError>;

/// Monitor orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorOrientation {
    #[default]
    Landscape,
    Portrait,
    LandscapeFlipped,
    PortraitFlipped,
}

impl MonitorOrientation {
    /// Translate the wire orientation value; unknown values fall back
    /// to landscape.
    pub fn from_wire(value: u32) -> Self {
        match value {
            90 => MonitorOrientation::Portrait,
            180 => MonitorOrientation::LandscapeFlipped,
            270 => MonitorOrientation::PortraitFlipped,
            _ => MonitorOrientation::Landscape,
        }
    }
}

/// One sanitized virtual monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMonitor {
    pub pos_x: i32,
    pub pos_y: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
    /// Physical size in millimeters; both zero when the client data
    /// was absent or implausible.
    pub physical_width: u32,
    pub physical_height: u32,
    pub orientation: MonitorOrientation,
    /// Desktop scale in percent, or 0 when outside [100, 500].
    pub scale: u32,
}

/// A validated client monitor layout.
///
/// Invariants established by construction: exactly one primary, the
/// primary anchored at (0, 0), no overlapping rectangles, all widths
/// even.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Extended (virtual monitor) mode vs. mirroring host connectors.
    pub is_virtual: bool,
    /// Connector names, mirror mode only.
    pub connectors: Vec<String>,
    /// Virtual monitor descriptors, extended mode only.
    pub virtual_monitors: Vec<VirtualMonitor>,
    /// Top-left corner of the layout bounding box (≤ 0 on both axes).
    pub layout_offset_x: i32,
    pub layout_offset_y: i32,
    /// Bounding box of the layout.
    pub desktop_width: u32,
    pub desktop_height: u32,
}

/// Clamp a value into [lower, upper], returning 0 when it falls
/// outside (the caller treats 0 as "not provided").
fn sanitize_value(value: u32, lower_bound: u32, upper_bound: u32) -> u32 {
    debug_assert!(lower_bound > 0 && lower_bound < upper_bound);
    if value < lower_bound || value > upper_bound {
        return 0;
    }
    value
}

#[allow(clippy::too_many_arguments)]
fn sanitized_monitor(
    pos_x: i32,
    pos_y: i32,
    width: u32,
    height: u32,
    is_primary: bool,
    physical_width: u32,
    physical_height: u32,
    orientation: u32,
    scale: u32,
) -> Result<VirtualMonitor> {
    if width % 2 != 0
        || width < MONITOR_MIN_SIZE
        || height < MONITOR_MIN_SIZE
        || width > MONITOR_MAX_SIZE
        || height > MONITOR_MAX_SIZE
    {
        return Err(MonitorConfigError::InvalidDimensions(width, height));
    }

    let mut physical_width = sanitize_value(physical_width, 10, 10000);
    let mut physical_height = sanitize_value(physical_height, 10, 10000);
    if physical_width == 0 || physical_height == 0 {
        physical_width = 0;
        physical_height = 0;
    }

    Ok(VirtualMonitor {
        pos_x,
        pos_y,
        width,
        height,
        is_primary,
        physical_width,
        physical_height,
        orientation: MonitorOrientation::from_wire(orientation),
        scale: sanitize_value(scale, 100, 500),
    })
}

/// Elect a primary when no flagged monitor survived: the first monitor
/// anchored at the origin wins.
fn determine_primary_monitor(monitors: &mut [VirtualMonitor]) -> Result<()> {
    for monitor in monitors.iter_mut() {
        if monitor.pos_x == 0 && monitor.pos_y == 0 {
            monitor.is_primary = true;
            return Ok(());
        }
    }
    Err(MonitorConfigError::NoPrimaryMonitor)
}

fn rects_overlap(a: &VirtualMonitor, b: &VirtualMonitor) -> bool {
    a.pos_x < b.pos_x + b.width as i32
        && b.pos_x < a.pos_x + a.width as i32
        && a.pos_y < b.pos_y + b.height as i32
        && b.pos_y < a.pos_y + a.height as i32
}

impl MonitorConfig {
    /// Mirror-mode config over host connector names.
    pub fn from_connectors(connectors: Vec<String>) -> Self {
        MonitorConfig {
            is_virtual: false,
            connectors,
            virtual_monitors: Vec::new(),
            layout_offset_x: 0,
            layout_offset_y: 0,
            desktop_width: 0,
            desktop_height: 0,
        }
    }

    /// Build from client data: the TS_UD_CS_MONITOR block when present
    /// and within the monitor cap, otherwise the core data block.
    pub fn from_client_data(caps: &ClientCapabilities, max_monitor_count: u32) -> Result<Self> {
        if caps.monitors.is_empty() || caps.monitors.len() > max_monitor_count as usize {
            return Self::from_client_core_data(caps);
        }
        Self::from_client_monitor_data(caps)
    }

    /// Single virtual monitor from the core data block
    /// ([MS-RDPBCGR] 2.2.1.3.2 TS_UD_CS_CORE).
    fn from_client_core_data(caps: &ClientCapabilities) -> Result<Self> {
        let monitor = sanitized_monitor(
            0,
            0,
            caps.desktop_width,
            caps.desktop_height,
            true,
            caps.physical_width,
            caps.physical_height,
            caps.orientation,
            caps.scale,
        )?;

        Ok(MonitorConfig {
            is_virtual: true,
            connectors: Vec::new(),
            desktop_width: monitor.width,
            desktop_height: monitor.height,
            layout_offset_x: 0,
            layout_offset_y: 0,
            virtual_monitors: vec![monitor],
        })
    }

    /// Multi-monitor layout from the TS_UD_CS_MONITOR block
    /// ([MS-RDPBCGR] 2.2.1.3.6).
    fn from_client_monitor_data(caps: &ClientCapabilities) -> Result<Self> {
        let mut found_primary = false;
        let mut monitors = Vec::with_capacity(caps.monitors.len());

        for monitor in &caps.monitors {
            let mut is_primary = monitor.is_primary;
            if found_primary || monitor.x != 0 || monitor.y != 0 {
                is_primary = false;
            }
            if !found_primary && is_primary {
                found_primary = true;
            }

            let (physical_width, physical_height, orientation, scale) =
                if caps.has_monitor_attributes {
                    (
                        monitor.physical_width,
                        monitor.physical_height,
                        monitor.orientation,
                        monitor.scale,
                    )
                } else {
                    (0, 0, 0, 0)
                };

            monitors.push(sanitized_monitor(
                monitor.x,
                monitor.y,
                monitor.width,
                monitor.height,
                is_primary,
                physical_width,
                physical_height,
                orientation,
                scale,
            )?);
        }

        Self::finish_layout(monitors, found_primary)
    }

    /// Layout from a DISPLAYCONTROL_MONITOR_LAYOUT PDU
    /// ([MS-RDPEDISP] 2.2.2.2.1).
    pub fn from_disp_monitor_layout(
        layout: &MonitorLayoutPdu,
        max_monitor_count: u32,
    ) -> Result<Self> {
        if layout.monitors.is_empty() {
            return Err(MonitorConfigError::NoMonitors);
        }
        if layout.monitors.len() > max_monitor_count as usize {
            return Err(MonitorConfigError::TooManyMonitors(
                layout.monitors.len(),
                max_monitor_count,
            ));
        }

        let mut found_primary = false;
        let mut monitors = Vec::with_capacity(layout.monitors.len());

        for monitor in &layout.monitors {
            let mut is_primary = monitor.is_primary;
            if found_primary || monitor.left != 0 || monitor.top != 0 {
                is_primary = false;
            }
            if !found_primary && is_primary {
                found_primary = true;
            }

            monitors.push(sanitized_monitor(
                monitor.left,
                monitor.top,
                monitor.width,
                monitor.height,
                is_primary,
                monitor.physical_width,
                monitor.physical_height,
                monitor.orientation,
                monitor.scale,
            )?);
        }

        Self::finish_layout(monitors, found_primary)
    }

    fn finish_layout(mut monitors: Vec<VirtualMonitor>, found_primary: bool) -> Result<Self> {
        if !found_primary {
            determine_primary_monitor(&mut monitors)?;
        }

        for (i, a) in monitors.iter().enumerate() {
            for b in monitors.iter().skip(i + 1) {
                if rects_overlap(a, b) {
                    return Err(MonitorConfigError::OverlappingMonitors);
                }
            }
        }

        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        for monitor in &monitors {
            min_x = min_x.min(monitor.pos_x);
            min_y = min_y.min(monitor.pos_y);
            max_x = max_x.max(monitor.pos_x + monitor.width as i32);
            max_y = max_y.max(monitor.pos_y + monitor.height as i32);
        }

        // The primary sits at (0, 0), so the bounding box never starts
        // right or below the origin.
        debug_assert!(min_x <= 0 && min_y <= 0);

        Ok(MonitorConfig {
            is_virtual: true,
            connectors: Vec::new(),
            virtual_monitors: monitors,
            layout_offset_x: min_x,
            layout_offset_y: min_y,
            desktop_width: (max_x - min_x) as u32,
            desktop_height: (max_y - min_y) as u32,
        })
    }

    /// Number of monitors in this layout (either mode).
    pub fn monitor_count(&self) -> usize {
        if self.is_virtual {
            self.virtual_monitors.len()
        } else {
            self.connectors.len()
        }
    }

    /// The primary virtual monitor, if this is an extended layout.
    pub fn primary(&self) -> Option<&VirtualMonitor> {
        self.virtual_monitors.iter().find(|m| m.is_primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::pdu::DispMonitorLayout;

    fn disp_monitor(left: i32, top: i32, width: u32, height: u32, primary: bool) -> DispMonitorLayout {
        DispMonitorLayout {
            left,
            top,
            width,
            height,
            is_primary: primary,
            physical_width: 0,
            physical_height: 0,
            orientation: 0,
            scale: 100,
        }
    }

    fn layout_of(monitors: Vec<DispMonitorLayout>) -> MonitorLayoutPdu {
        MonitorLayoutPdu { monitors }
    }

    #[test]
    fn test_core_data_single_monitor() {
        let caps = ClientCapabilities {
            desktop_width: 1920,
            desktop_height: 1080,
            ..Default::default()
        };

        let config = MonitorConfig::from_client_data(&caps, 16).unwrap();
        assert!(config.is_virtual);
        assert_eq!(config.monitor_count(), 1);
        assert_eq!(config.desktop_width, 1920);
        assert_eq!(config.desktop_height, 1080);
        assert!(config.virtual_monitors[0].is_primary);
    }

    #[test]
    fn test_odd_width_rejected() {
        let caps = ClientCapabilities {
            desktop_width: 1921,
            desktop_height: 1080,
            ..Default::default()
        };

        assert_eq!(
            MonitorConfig::from_client_data(&caps, 16),
            Err(MonitorConfigError::InvalidDimensions(1921, 1080))
        );
    }

    #[test]
    fn test_dimensions_out_of_range_rejected() {
        let caps = ClientCapabilities {
            desktop_width: 198,
            desktop_height: 1080,
            ..Default::default()
        };
        assert!(MonitorConfig::from_client_data(&caps, 16).is_err());

        let caps = ClientCapabilities {
            desktop_width: 8194,
            desktop_height: 1080,
            ..Default::default()
        };
        assert!(MonitorConfig::from_client_data(&caps, 16).is_err());
    }

    #[test]
    fn test_disp_three_monitor_layout() {
        // Scenario: primary at origin, one to the right, one to the left.
        let layout = layout_of(vec![
            disp_monitor(0, 0, 1920, 1080, true),
            disp_monitor(1920, 0, 1280, 1024, false),
            disp_monitor(-1280, 0, 1280, 1024, false),
        ]);

        let config = MonitorConfig::from_disp_monitor_layout(&layout, 16).unwrap();
        assert_eq!(config.desktop_width, 4480);
        assert_eq!(config.layout_offset_x, -1280);
        assert_eq!(config.layout_offset_y, 0);
        assert_eq!(config.monitor_count(), 3);
        assert!(config.virtual_monitors[0].is_primary);
        assert!(!config.virtual_monitors[1].is_primary);
        assert!(!config.virtual_monitors[2].is_primary);
    }

    #[test]
    fn test_disp_overlap_rejected() {
        let layout = layout_of(vec![
            disp_monitor(0, 0, 1920, 1080, true),
            disp_monitor(1000, 0, 1280, 1024, false),
        ]);

        assert_eq!(
            MonitorConfig::from_disp_monitor_layout(&layout, 16),
            Err(MonitorConfigError::OverlappingMonitors)
        );
    }

    #[test]
    fn test_disp_empty_rejected() {
        let layout = layout_of(vec![]);
        assert_eq!(
            MonitorConfig::from_disp_monitor_layout(&layout, 16),
            Err(MonitorConfigError::NoMonitors)
        );
    }

    #[test]
    fn test_disp_monitor_cap() {
        let layout = layout_of(vec![
            disp_monitor(0, 0, 1920, 1080, true),
            disp_monitor(1920, 0, 1920, 1080, false),
        ]);
        assert_eq!(
            MonitorConfig::from_disp_monitor_layout(&layout, 1),
            Err(MonitorConfigError::TooManyMonitors(2, 1))
        );
    }

    #[test]
    fn test_primary_election_falls_back_to_origin() {
        // Primary flag on a monitor away from the origin is discarded;
        // the monitor at (0, 0) is elected instead.
        let layout = layout_of(vec![
            disp_monitor(1920, 0, 1280, 1024, true),
            disp_monitor(0, 0, 1920, 1080, false),
        ]);

        let config = MonitorConfig::from_disp_monitor_layout(&layout, 16).unwrap();
        assert!(!config.virtual_monitors[0].is_primary);
        assert!(config.virtual_monitors[1].is_primary);
    }

    #[test]
    fn test_no_monitor_at_origin_rejected() {
        let layout = layout_of(vec![
            disp_monitor(100, 100, 1920, 1080, true),
            disp_monitor(2020, 100, 1280, 1024, false),
        ]);

        assert_eq!(
            MonitorConfig::from_disp_monitor_layout(&layout, 16),
            Err(MonitorConfigError::NoPrimaryMonitor)
        );
    }

    #[test]
    fn test_physical_size_zeroed_when_implausible() {
        let mut monitor = disp_monitor(0, 0, 1920, 1080, true);
        monitor.physical_width = 5;
        monitor.physical_height = 300;

        let config =
            MonitorConfig::from_disp_monitor_layout(&layout_of(vec![monitor]), 16).unwrap();
        assert_eq!(config.virtual_monitors[0].physical_width, 0);
        assert_eq!(config.virtual_monitors[0].physical_height, 0);
    }

    #[test]
    fn test_scale_sanitized() {
        let mut monitor = disp_monitor(0, 0, 1920, 1080, true);
        monitor.scale = 600;

        let config =
            MonitorConfig::from_disp_monitor_layout(&layout_of(vec![monitor]), 16).unwrap();
        assert_eq!(config.virtual_monitors[0].scale, 0);
    }

    #[test]
    fn test_orientation_translation() {
        assert_eq!(MonitorOrientation::from_wire(0), MonitorOrientation::Landscape);
        assert_eq!(MonitorOrientation::from_wire(90), MonitorOrientation::Portrait);
        assert_eq!(
            MonitorOrientation::from_wire(180),
            MonitorOrientation::LandscapeFlipped
        );
        assert_eq!(
            MonitorOrientation::from_wire(270),
            MonitorOrientation::PortraitFlipped
        );
        assert_eq!(MonitorOrientation::from_wire(45), MonitorOrientation::Landscape);
    }
}
