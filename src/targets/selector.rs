use rand::Rng;

use super::{Catalog, Fields, TlbField};
use crate::error::{Error, Result};
use crate::injection::{InjectionDescriptor, Timing};

/// Picks one of `items` with a probability proportional to its weight.
///
/// A uniform draw in `[0, Σweights)` is compared against the running sum of
/// the weights. Returns `None` when the total weight is zero.
pub fn weighted_pick<'a, T, R: Rng + ?Sized>(items: &'a [(T, u64)], rng: &mut R) -> Option<&'a T> {
    let total: u64 = items.iter().map(|(_, weight)| weight).sum();
    if total == 0 {
        return None;
    }
    let draw = rng.gen_range(0..total);
    let mut sum = 0;
    for (item, weight) in items {
        sum += weight;
        if draw < sum {
            return Some(item);
        }
    }
    None
}

/// Weighted hierarchical walk over a catalog: target, then register, then bit.
pub struct Selector<'a, R: Rng> {
    catalog: &'a Catalog,
    selected_targets: Option<Vec<String>>,
    selected_indices: Option<Vec<usize>>,
    rng: R,
}

impl<'a, R: Rng> Selector<'a, R> {
    pub fn new(catalog: &'a Catalog, rng: R) -> Self {
        Self {
            catalog,
            selected_targets: None,
            selected_indices: None,
            rng,
        }
    }

    /// Restricts selection to the named targets.
    pub fn with_targets(mut self, targets: Option<Vec<String>>) -> Result<Self> {
        if let Some(targets) = &targets {
            self.catalog.validate_selection(targets)?;
        }
        self.selected_targets = targets;
        Ok(self)
    }

    /// Restricts the instance index of replicated targets.
    pub fn with_indices(mut self, indices: Option<Vec<usize>>) -> Self {
        self.selected_indices = indices;
        self
    }

    /// Chooses a target and, for replicated targets, an instance index.
    pub fn choose_target(&mut self) -> Result<(String, Option<usize>)> {
        let candidates: Vec<(&String, u64)> = self
            .catalog
            .targets()
            .filter(|(name, _)| match &self.selected_targets {
                Some(selected) => selected.contains(*name),
                None => true,
            })
            .map(|(name, target)| (name, target.total_bits))
            .collect();
        let name = (*weighted_pick(&candidates, &mut self.rng).ok_or(Error::NoCandidates)?).clone();

        let target_index = match self.catalog.get(&name).and_then(|t| t.count) {
            Some(count) => {
                let allowed: Vec<usize> = match &self.selected_indices {
                    Some(indices) => indices.iter().copied().filter(|i| *i < count).collect(),
                    None => (0..count).collect(),
                };
                if allowed.is_empty() {
                    return Err(Error::NoCandidates);
                }
                Some(allowed[self.rng.gen_range(0..allowed.len())])
            }
            None => None,
        };
        Ok((name, target_index))
    }

    /// Chooses a register of `target`. Returns the register name, its array
    /// index and, for aliases, the catalog name of the register.
    pub fn choose_register(&mut self, target: &str) -> Result<(String, Option<Vec<usize>>, Option<String>)> {
        let catalog = self.catalog;
        let registers = &catalog
            .get(target)
            .ok_or_else(|| Error::Catalog(format!("invalid injection target: {}", target)))?
            .registers;
        let candidates: Vec<(&String, u64)> = registers
            .iter()
            .map(|(name, register)| (name, register.total_bits))
            .collect();
        let name = weighted_pick(&candidates, &mut self.rng).ok_or(Error::NoCandidates)?;
        let register = &registers[*name];

        let mut register_index = if register.count.is_empty() {
            None
        } else {
            Some(
                register
                    .count
                    .iter()
                    .map(|dimension| self.rng.gen_range(0..*dimension))
                    .collect::<Vec<_>>(),
            )
        };

        match &register.alias {
            Some(alias) => {
                if alias.register_index.is_some() {
                    register_index = alias.register_index.clone();
                }
                Ok((alias.register.clone(), register_index, Some((*name).clone())))
            }
            None => Ok(((*name).clone(), register_index, None)),
        }
    }

    /// Chooses the bit (and field) to flip. TLB registers overwrite the
    /// innermost index of `register_index` with the storage word of the field.
    pub fn choose_bit(
        &mut self,
        target: &str,
        register: &str,
        register_index: &mut Option<Vec<usize>>,
    ) -> Result<(u32, Option<String>)> {
        let catalog = self.catalog;
        let spec = catalog.register(target, register)?;
        match (&spec.fields, spec.is_tlb) {
            (Some(Fields::Tlb(fields)), true) => {
                let candidates: Vec<(&String, u64)> = fields
                    .iter()
                    .map(|(name, field)| (name, field.bits() as u64))
                    .collect();
                let name = weighted_pick(&candidates, &mut self.rng)
                    .ok_or_else(|| Error::Catalog("Error choosing TLB field to inject".to_string()))?;
                let (index, range) = match &fields[*name] {
                    TlbField::Split {
                        bits_l,
                        bits_h,
                        index_l,
                        index_h,
                        bit_indices_l,
                        bit_indices_h,
                        ..
                    } => {
                        if self.rng.gen_range(0..(*bits_l + *bits_h)) < *bits_l {
                            (*index_l, *bit_indices_l)
                        } else {
                            (*index_h, *bit_indices_h)
                        }
                    }
                    TlbField::Single {
                        index, bit_indices, ..
                    } => (*index, *bit_indices),
                };
                let innermost = register_index
                    .as_mut()
                    .and_then(|index| index.last_mut())
                    .ok_or_else(|| {
                        Error::Catalog(format!("TLB register {} in {} has no dimensions", register, target))
                    })?;
                *innermost = index;
                let bit = self.rng.gen_range(range[0].min(range[1])..=range[0].max(range[1]));
                Ok((bit, Some((*name).clone())))
            }
            _ => {
                let mut bit = self.rng.gen_range(0..spec.bits);
                if !spec.adjust_bit.is_empty() {
                    bit = spec.adjust_bit[bit as usize];
                }
                let field = match &spec.fields {
                    Some(Fields::Ranges(_)) => Some(
                        spec.field_of(bit)
                            .ok_or_else(|| {
                                Error::Catalog(format!(
                                    "Error finding register field name for target: {}, register: {}, bit: {}",
                                    target, register, bit
                                ))
                            })?
                            .to_string(),
                    ),
                    _ => None,
                };
                Ok((bit, field))
            }
        }
    }

    /// Produces one complete injection descriptor.
    pub fn choose_injection(&mut self, time: Option<Timing>) -> Result<InjectionDescriptor> {
        let (target, target_index) = self.choose_target()?;
        let (register, mut register_index, register_alias) = self.choose_register(&target)?;
        let catalog_register = register_alias.clone().unwrap_or_else(|| register.clone());
        let (bit, field) = self.choose_bit(&target, &catalog_register, &mut register_index)?;
        let num_bits = self.catalog.register(&target, &catalog_register)?.num_bits();
        Ok(InjectionDescriptor {
            target,
            target_index,
            register,
            register_alias,
            register_index,
            bit,
            field,
            num_bits,
            time,
        })
    }

    /// Draws `count` injection cycles uniformly from `[start, end]`, sorted ascending.
    pub fn choose_injection_times(&mut self, start: u64, end: u64, count: usize) -> Vec<u64> {
        let (low, high) = (start.min(end), start.max(end));
        let mut times: Vec<u64> = (0..count).map(|_| self.rng.gen_range(low..=high)).collect();
        times.sort_unstable();
        times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    const CATALOG: &str = r#"{
        SMALL: { registers: { status: { bits: 8 } } },
        LARGE: { count: 4, registers: { array: { count: [3], bits: 32 } } },
        TLB: {
            registers: {
                entry: {
                    count: [16, 3],
                    is_tlb: true,
                    fields: {
                        PA: {
                            split: true, bits: 20, bits_l: 8, bits_h: 12,
                            index_l: 1, index_h: 2,
                            bit_indices_l: [24, 31], bit_indices_h: [0, 11],
                        },
                    },
                },
            },
        },
        CPU: {
            registers: {
                cpsr: { bits: 6, partial: true, fields: [["M", [0, 4]], ["N", [31, 31]]] },
                r13_svc: { alias: { register: "sp_svc" } },
            },
        },
    }"#;

    #[test]
    fn weighting_law() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(7))
            .with_targets(Some(vec!["SMALL".to_string(), "LARGE".to_string()]))
            .unwrap();
        let draws = 40_000;
        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..draws {
            *hits.entry(selector.choose_target().unwrap().0).or_default() += 1;
        }
        // 8 bits against 96 bits.
        let small = hits["SMALL"] as f64 / draws as f64;
        assert!((small - 8.0 / 104.0).abs() < 0.01, "{}", small);
    }

    #[test]
    fn no_candidates() {
        let catalog = Catalog::from_str(r#"{ EMPTY: { registers: {} } }"#).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(1));
        assert!(matches!(selector.choose_target(), Err(Error::NoCandidates)));
        let selector = Selector::new(&catalog, StdRng::seed_from_u64(1)).with_targets(Some(vec!["NOPE".to_string()]));
        assert!(selector.is_err());
    }

    #[test]
    fn target_indices() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(3))
            .with_targets(Some(vec!["LARGE".to_string()]))
            .unwrap()
            .with_indices(Some(vec![2]));
        for _ in 0..20 {
            assert_eq!(selector.choose_target().unwrap(), ("LARGE".to_string(), Some(2)));
        }
    }

    #[test]
    fn tlb_split_overwrites_innermost_index() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(11));
        for _ in 0..200 {
            let mut index = Some(vec![5, 0]);
            let (bit, field) = selector.choose_bit("TLB", "entry", &mut index).unwrap();
            assert_eq!(field.as_deref(), Some("PA"));
            match index.unwrap()[1] {
                1 => assert!((24..=31).contains(&bit)),
                2 => assert!(bit <= 11),
                other => panic!("unexpected storage word {}", other),
            }
        }
    }

    #[test]
    fn partial_register_only_hits_implemented_bits() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(5));
        for _ in 0..200 {
            let (bit, field) = selector.choose_bit("CPU", "cpsr", &mut None).unwrap();
            assert!(bit <= 4 || bit == 31);
            assert_eq!(field.as_deref(), Some(if bit == 31 { "N" } else { "M" }));
        }
    }

    #[test]
    fn alias_and_times() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(9))
            .with_targets(Some(vec!["CPU".to_string()]))
            .unwrap();
        let mut seen_alias = false;
        for _ in 0..200 {
            let injection = selector.choose_injection(Some(Timing::Cycle(10))).unwrap();
            if injection.register_alias.is_some() {
                assert_eq!(injection.register, "sp_svc");
                assert_eq!(injection.catalog_register(), "r13_svc");
                assert_eq!(injection.num_bits, 32);
                seen_alias = true;
            }
        }
        assert!(seen_alias);

        let times = selector.choose_injection_times(100, 200, 50);
        assert_eq!(times.len(), 50);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times.iter().all(|t| (100..=200).contains(t)));
    }
}
