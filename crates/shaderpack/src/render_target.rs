use std::collections::BTreeSet;

/// Pre-`colortex` names for render targets 0-7.
pub const LEGACY_RENDER_TARGETS: [&str; 8] = [
    "gcolor", "gdepth", "gnormal", "composite", "gaux1", "gaux2", "gaux3", "gaux4",
];

pub const MAX_MODERN_RENDER_TARGETS: u32 = 16;

/// `colortex0..colortex15`, as exposed by current drivers.
pub fn modern_render_targets() -> BTreeSet<u32> {
    (0..MAX_MODERN_RENDER_TARGETS).collect()
}

pub fn legacy_render_targets() -> BTreeSet<u32> {
    (0..LEGACY_RENDER_TARGETS.len() as u32).collect()
}

pub fn legacy_name(index: u32) -> Option<&'static str> {
    LEGACY_RENDER_TARGETS.get(index as usize).copied()
}

/// Resolves `colortex<N>` or a legacy name to its index.
pub fn render_target_index(name: &str) -> Option<u32> {
    if let Some(digits) = name.strip_prefix("colortex") {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return digits.parse().ok();
    }
    LEGACY_RENDER_TARGETS
        .iter()
        .position(|legacy| *legacy == name)
        .map(|index| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_modern_and_legacy_names() {
        assert_eq!(render_target_index("colortex0"), Some(0));
        assert_eq!(render_target_index("colortex15"), Some(15));
        assert_eq!(render_target_index("gnormal"), Some(2));
        assert_eq!(render_target_index("gaux4"), Some(7));
        assert_eq!(render_target_index("colortex"), None);
        assert_eq!(render_target_index("colortex+1"), None);
        assert_eq!(render_target_index("shadowcolor0"), None);
    }

    #[test]
    fn supported_sets() {
        assert_eq!(modern_render_targets().len(), 16);
        assert_eq!(legacy_render_targets().iter().max(), Some(&7));
        assert_eq!(legacy_name(3), Some("composite"));
        assert_eq!(legacy_name(8), None);
    }
}
