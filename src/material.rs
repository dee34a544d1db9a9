use std::marker::PhantomData;

use rand::Rng;

use crate::error::{ResonatorError, Result};

/// Number of parameters in a material: density, Young's modulus, Poisson
/// ratio, alpha, beta
pub const N_MATERIAL_PARAMS: usize = 5;

/// Slack allowed past a range end, relative to the range width
pub const SCALE_TOLERANCE: f64 = 1e-9;

pub const PARAM_NAMES: [&str; N_MATERIAL_PARAMS] =
    ["density", "youngs_modulus", "poisson_ratio", "alpha", "beta"];

/// Values in SI units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Physical;

/// Values normalized to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaled;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange {
    min: f64,
    max: f64,
}

impl ParamRange {
    pub fn new(min: f64, max: f64) -> Result<ParamRange> {
        if !(min.is_finite() && max.is_finite()) || min >= max {
            return Err(ResonatorError::Material(format!(
                "Invalid parameter range [{min}, {max}]"
            )));
        }
        Ok(ParamRange { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    fn scale(&self, name: &str, value: f64) -> Result<f64> {
        let slack = SCALE_TOLERANCE * self.width();
        if !(value >= self.min - slack && value <= self.max + slack) {
            return Err(ResonatorError::Material(format!(
                "{name} = {value} is outside the configured range [{}, {}]",
                self.min, self.max
            )));
        }
        Ok((value - self.min) / self.width())
    }

    fn unscale(&self, name: &str, value: f64) -> Result<f64> {
        if !(value >= -SCALE_TOLERANCE && value <= 1.0 + SCALE_TOLERANCE) {
            return Err(ResonatorError::Material(format!(
                "scaled {name} = {value} is outside [0, 1]"
            )));
        }
        Ok(self.min + value * self.width())
    }
}

/// Per-parameter bounds used for sampling and normalization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialRanges {
    density: ParamRange,
    youngs_modulus: ParamRange,
    poisson_ratio: ParamRange,
    alpha: ParamRange,
    beta: ParamRange,
}

impl MaterialRanges {
    pub fn new(ranges: [ParamRange; N_MATERIAL_PARAMS]) -> Result<MaterialRanges> {
        let [density, youngs_modulus, poisson_ratio, alpha, beta] = ranges;
        for (range, name) in ranges.iter().zip(PARAM_NAMES) {
            ParamRange::new(range.min, range.max).map_err(|_| {
                ResonatorError::Material(format!(
                    "Invalid range for {name}: [{}, {}]",
                    range.min, range.max
                ))
            })?;
        }
        if poisson_ratio.min < 0.0 || poisson_ratio.max >= 0.5 {
            return Err(ResonatorError::Material(
                "Poisson ratio range must lie within [0, 0.5)".to_owned(),
            ));
        }
        if density.min <= 0.0 || youngs_modulus.min <= 0.0 || alpha.min < 0.0 || beta.min < 0.0 {
            return Err(ResonatorError::Material(
                "Density and Young's modulus must be positive, damping non-negative".to_owned(),
            ));
        }

        Ok(MaterialRanges {
            density,
            youngs_modulus,
            poisson_ratio,
            alpha,
            beta,
        })
    }

    pub fn density(&self) -> ParamRange {
        self.density
    }

    pub fn youngs_modulus(&self) -> ParamRange {
        self.youngs_modulus
    }

    pub fn poisson_ratio(&self) -> ParamRange {
        self.poisson_ratio
    }

    pub fn alpha(&self) -> ParamRange {
        self.alpha
    }

    pub fn beta(&self) -> ParamRange {
        self.beta
    }

    pub fn as_array(&self) -> [ParamRange; N_MATERIAL_PARAMS] {
        [
            self.density,
            self.youngs_modulus,
            self.poisson_ratio,
            self.alpha,
            self.beta,
        ]
    }
}

impl Default for MaterialRanges {
    fn default() -> Self {
        MaterialRanges {
            density: ParamRange { min: 500.0, max: 10_000.0 },
            youngs_modulus: ParamRange { min: 1e9, max: 2.5e11 },
            poisson_ratio: ParamRange { min: 0.1, max: 0.45 },
            alpha: ParamRange { min: 0.1, max: 100.0 },
            beta: ParamRange { min: 1e-8, max: 1e-5 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material<R = Physical> {
    params: [f64; N_MATERIAL_PARAMS],
    representation: PhantomData<R>,
}

impl<R> Material<R> {
    /// Parameters in the fixed order density, Young's modulus, Poisson
    /// ratio, alpha, beta
    pub fn params(&self) -> [f64; N_MATERIAL_PARAMS] {
        self.params
    }

    pub fn density(&self) -> f64 {
        self.params[0]
    }

    pub fn youngs_modulus(&self) -> f64 {
        self.params[1]
    }

    pub fn poisson_ratio(&self) -> f64 {
        self.params[2]
    }

    pub fn alpha(&self) -> f64 {
        self.params[3]
    }

    pub fn beta(&self) -> f64 {
        self.params[4]
    }
}

impl Material<Physical> {
    pub fn new(
        density: f64,
        youngs_modulus: f64,
        poisson_ratio: f64,
        alpha: f64,
        beta: f64,
    ) -> Result<Material<Physical>> {
        Self::from_params([density, youngs_modulus, poisson_ratio, alpha, beta])
    }

    pub fn from_params(params: [f64; N_MATERIAL_PARAMS]) -> Result<Material<Physical>> {
        let [density, youngs_modulus, poisson_ratio, alpha, beta] = params;

        if let Some(i) = params.iter().position(|p| !p.is_finite()) {
            return Err(ResonatorError::Material(format!(
                "{} is not finite",
                PARAM_NAMES[i]
            )));
        }
        if density <= 0.0 {
            return Err(ResonatorError::Material(format!(
                "Density must be positive, got {density}"
            )));
        }
        if youngs_modulus <= 0.0 {
            return Err(ResonatorError::Material(format!(
                "Young's modulus must be positive, got {youngs_modulus}"
            )));
        }
        if !(0.0..0.5).contains(&poisson_ratio) {
            return Err(ResonatorError::Material(format!(
                "Poisson ratio must lie in [0, 0.5), got {poisson_ratio}"
            )));
        }
        if alpha < 0.0 || beta < 0.0 {
            return Err(ResonatorError::Material(format!(
                "Damping coefficients must be non-negative, got alpha = {alpha}, beta = {beta}"
            )));
        }

        Ok(Material {
            params,
            representation: PhantomData,
        })
    }

    /// Samples every parameter uniformly from its range
    pub fn random<G: Rng + ?Sized>(ranges: &MaterialRanges, rng: &mut G) -> Material<Physical> {
        let params = ranges.as_array().map(|r| rng.gen_range(r.min..=r.max));
        Material {
            params,
            representation: PhantomData,
        }
    }

    /// Looks up one of the preset materials by name
    pub fn preset(name: &str) -> Result<Material<Physical>> {
        PRESETS
            .iter()
            .find(|(preset, _)| preset.eq_ignore_ascii_case(name))
            .map(|(_, params)| Self::from_params(*params))
            .unwrap_or_else(|| {
                Err(ResonatorError::Input(format!(
                    "Unknown material {name}. Known materials: {}",
                    PRESETS.map(|(n, _)| n).join(", ")
                )))
            })
    }

    pub fn scaled(&self, ranges: &MaterialRanges) -> Result<Material<Scaled>> {
        let ranges = ranges.as_array();
        let mut params = [0.0; N_MATERIAL_PARAMS];
        for i in 0..N_MATERIAL_PARAMS {
            params[i] = ranges[i].scale(PARAM_NAMES[i], self.params[i])?;
        }
        Ok(Material {
            params,
            representation: PhantomData,
        })
    }

    /// Shear modulus `G = E / (2 (1 + nu))`, the stiffness of transverse shear
    pub fn shear_modulus(&self) -> f64 {
        self.youngs_modulus() / (2.0 * (1.0 + self.poisson_ratio()))
    }

    /// Squared transverse wave speed `G / rho`
    pub fn wave_speed_squared(&self) -> f64 {
        self.shear_modulus() / self.density()
    }
}

impl Material<Scaled> {
    pub fn from_params(params: [f64; N_MATERIAL_PARAMS]) -> Material<Scaled> {
        Material {
            params,
            representation: PhantomData,
        }
    }

    pub fn unscaled(&self, ranges: &MaterialRanges) -> Result<Material<Physical>> {
        let ranges = ranges.as_array();
        let mut params = [0.0; N_MATERIAL_PARAMS];
        for i in 0..N_MATERIAL_PARAMS {
            params[i] = ranges[i].unscale(PARAM_NAMES[i], self.params[i])?;
        }
        Material::<Physical>::from_params(params)
    }
}

/// Rayleigh-damped materials: density, Young's modulus, Poisson ratio,
/// alpha, beta. Elastic constants are common textbook values; the damping
/// pairs are hand-tuned by ear.
pub const PRESETS: [(&str, [f64; N_MATERIAL_PARAMS]); 8] = [
    ("ceramic", [2700.0, 7.2e10, 0.19, 6.0, 1e-7]),
    ("glass", [2600.0, 6.2e10, 0.20, 1.0, 1e-7]),
    ("wood", [750.0, 1.1e10, 0.25, 60.0, 2e-6]),
    ("plastic", [1070.0, 1.4e9, 0.35, 30.0, 1e-6]),
    ("iron", [8000.0, 2.1e11, 0.28, 5.0, 1e-7]),
    ("polycarbonate", [1190.0, 2.4e9, 0.37, 0.5, 4e-7]),
    ("steel", [7850.0, 2.0e11, 0.29, 5.0, 3e-8]),
    ("aluminium", [2700.0, 7.0e10, 0.33, 0.5, 1e-7]),
];

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn presets_fit_default_ranges() {
        let ranges = MaterialRanges::default();
        for (name, _) in PRESETS {
            let material = Material::preset(name).unwrap();
            let scaled = material.scaled(&ranges).unwrap();
            assert!(scaled.params().iter().all(|p| (0.0..=1.0).contains(p)), "{name}");
        }
        assert!(Material::preset("Ceramic").is_ok());
        assert!(matches!(
            Material::preset("unobtainium"),
            Err(ResonatorError::Input(_))
        ));
    }

    proptest! {
        #[test]
        fn scale_round_trip(seed in any::<u64>()) {
            let ranges = MaterialRanges::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let material = Material::random(&ranges, &mut rng);
            let back = material.scaled(&ranges).unwrap().unscaled(&ranges).unwrap();
            for (a, b) in material.params().iter().zip(back.params()) {
                prop_assert!((a - b).abs() <= 1e-12 * a.abs().max(1e-300));
            }
        }
    }

    #[test]
    fn scaled_values_are_normalized() {
        let ranges = MaterialRanges::default();
        let lowest = Material::<Physical>::from_params(ranges.as_array().map(|r| r.min)).unwrap();
        let highest = Material::<Physical>::from_params(ranges.as_array().map(|r| r.max)).unwrap();
        assert_eq!(lowest.scaled(&ranges).unwrap().params(), [0.0; 5]);
        assert_eq!(highest.scaled(&ranges).unwrap().params(), [1.0; 5]);
    }

    #[test]
    fn out_of_range_is_an_error_not_a_clamp() {
        let ranges = MaterialRanges::default();
        let light = Material::new(100.0, 7e10, 0.3, 1.0, 1e-7).unwrap();
        assert!(matches!(light.scaled(&ranges), Err(ResonatorError::Material(_))));

        let overdriven = Material::<Scaled>::from_params([0.5, 0.5, 1.5, 0.5, 0.5]);
        assert!(matches!(
            overdriven.unscaled(&ranges),
            Err(ResonatorError::Material(_))
        ));
    }

    #[test]
    fn physical_validation() {
        assert!(Material::new(-1.0, 7e10, 0.3, 1.0, 1e-7).is_err());
        assert!(Material::new(1000.0, 0.0, 0.3, 1.0, 1e-7).is_err());
        assert!(Material::new(1000.0, 7e10, 0.5, 1.0, 1e-7).is_err());
        assert!(Material::new(1000.0, 7e10, 0.3, -1.0, 1e-7).is_err());
        assert!(Material::new(f64::NAN, 7e10, 0.3, 1.0, 1e-7).is_err());
    }

    #[test]
    fn custom_ranges_change_the_normalization() {
        let narrow = MaterialRanges::new([
            ParamRange::new(2000.0, 3000.0).unwrap(),
            ParamRange::new(5e10, 1e11).unwrap(),
            ParamRange::new(0.1, 0.3).unwrap(),
            ParamRange::new(0.0, 10.0).unwrap(),
            ParamRange::new(0.0, 1e-6).unwrap(),
        ])
        .unwrap();
        let ceramic = Material::preset("ceramic").unwrap();
        let scaled = ceramic.scaled(&narrow).unwrap();
        assert_relative_eq!(scaled.density(), 0.7, epsilon = 1e-12);
        assert_relative_eq!(scaled.alpha(), 0.6, epsilon = 1e-12);

        assert!(ParamRange::new(1.0, 1.0).is_err());
        assert!(MaterialRanges::new([
            ParamRange::new(1.0, 2.0).unwrap(),
            ParamRange::new(1.0, 2.0).unwrap(),
            ParamRange::new(0.1, 0.6).unwrap(),
            ParamRange::new(1.0, 2.0).unwrap(),
            ParamRange::new(1.0, 2.0).unwrap(),
        ])
        .is_err());
    }

    #[test]
    fn inverted_ranges_are_rejected_before_sampling() {
        assert!(matches!(
            ParamRange::new(3000.0, 2000.0),
            Err(ResonatorError::Material(_))
        ));

        let ranges = MaterialRanges::new([
            ParamRange::new(2000.0, 3000.0).unwrap(),
            ParamRange::new(5e10, 1e11).unwrap(),
            ParamRange::new(0.1, 0.3).unwrap(),
            ParamRange::new(0.0, 10.0).unwrap(),
            ParamRange::new(0.0, 1e-6).unwrap(),
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..100 {
            let material = Material::random(&ranges, &mut rng);
            for (value, range) in material.params().iter().zip(ranges.as_array()) {
                assert!(*value >= range.min() && *value <= range.max());
            }
        }
    }

    #[test]
    fn shear_modulus() {
        let m = Material::new(1000.0, 2.6e9, 0.3, 0.0, 0.0).unwrap();
        assert_relative_eq!(m.shear_modulus(), 1e9, max_relative = 1e-12);
        assert_relative_eq!(m.wave_speed_squared(), 1e6, max_relative = 1e-12);
    }
}
