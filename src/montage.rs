use crate::types::ElectrodePlacement;

/// 3D electrode positions on a fitted head sphere
///
/// No fiducials (nasion, left/right pre-auricular points) are derived.
/// Consumers that need a registered head coordinate frame must supply them.
#[derive(Debug, Clone, PartialEq)]
pub struct Montage {
    /// Source placement document
    pub name: String,
    pub ch_names: Vec<String>,
    pub positions: Vec<[f64; 3]>,
    pub sphere_radius: f64,
}

impl Montage {
    pub fn contains(&self, ch_name: &str) -> bool {
        self.ch_names.iter().any(|ch| ch == ch_name)
    }

    pub fn position(&self, ch_name: &str) -> Option<[f64; 3]> {
        self.ch_names
            .iter()
            .position(|ch| ch == ch_name)
            .map(|idx| self.positions[idx])
    }

    pub fn len(&self) -> usize {
        self.ch_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ch_names.is_empty()
    }
}

/// Lifts a normalized 2D placement onto the sphere through its outermost electrode
///
/// The sphere radius is the largest planar radius; each electrode gets
/// `z = sqrt(r_sphere^2 - r_point^2)`, so the outermost electrodes sit on
/// the equator and the rest on the upper hemisphere.
pub fn build_montage(placement: &ElectrodePlacement) -> Montage {
    let radii2: Vec<f64> = placement
        .positions
        .iter()
        .map(|p| p[0] * p[0] + p[1] * p[1])
        .collect();
    let sphere_r2 = radii2.iter().copied().fold(0.0_f64, f64::max);
    log::debug!("Head sphere radius {}m", sphere_r2.sqrt());

    let positions = placement
        .positions
        .iter()
        .zip(&radii2)
        .map(|(p, r2)| [p[0], p[1], (sphere_r2 - r2).max(0.0).sqrt()])
        .collect();

    Montage {
        name: placement.name.clone(),
        ch_names: placement.ch_names.clone(),
        positions,
        sphere_radius: sphere_r2.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::normalize_positions;
    use crate::HEAD_RADIUS;

    #[test]
    fn test_points_on_sphere() {
        let mut positions = vec![[0.0, 0.0], [2.0, 0.0], [0.0, 2.0], [1.0, 1.0]];
        normalize_positions(&mut positions).unwrap();
        let placement = ElectrodePlacement {
            name: "p.xml".to_string(),
            ch_names: vec!["A".into(), "B".into(), "C".into(), "D".into()],
            positions,
        };

        let montage = build_montage(&placement);
        assert!((montage.sphere_radius - HEAD_RADIUS).abs() < 1e-12);
        assert_eq!(montage.len(), 4);

        for p in &montage.positions {
            let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            assert!((r - montage.sphere_radius).abs() < 1e-12);
            assert!(p[2] >= 0.0);
        }

        // 最外侧电极位于赤道
        let outer = montage
            .positions
            .iter()
            .map(|p| p[2])
            .fold(f64::INFINITY, f64::min);
        assert!(outer.abs() < 1e-9);

        assert!(montage.contains("C"));
        assert!(!montage.contains("Z"));
        assert_eq!(montage.position("A").map(|p| p[0]), Some(placement.positions[0][0]));
    }
}
