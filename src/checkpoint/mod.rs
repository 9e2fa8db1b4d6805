//! Bit surgery on simulator checkpoints.
//!
//! A checkpoint is a directory holding a `config` text file made of
//! `OBJECT <name> TYPE <type> {` blocks with one `\t<key>: <value>` attribute
//! per line (lists may continue over several lines). Injection splits the
//! config around the target attribute, mutates the parsed value and joins the
//! pieces again, so every byte outside the rewritten attribute is preserved.

pub mod memory;
pub mod value;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::injection::{flip_bit, InjectionDescriptor, InjectionRecord};
use crate::targets::{Catalog, Target};
pub use memory::{compare_memory, MemoryDiff};
pub use value::Value;

/// Name of the file holding the object configuration inside a checkpoint.
pub const CONFIG_FILE: &str = "config";

/// Config text split around one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitConfig {
    /// Everything up to the attribute, including the object header.
    pub before: String,
    /// The complete, possibly multi-line, `\t<key>: <value>` text.
    pub entry: String,
    /// Everything after the attribute.
    pub after: String,
}

impl SplitConfig {
    /// Locates `register` inside the `OBJECT <object> TYPE <object_type> {` block.
    pub fn split(config: &str, object: &str, object_type: &str, register: &str) -> Result<Self> {
        let header = format!("OBJECT {} TYPE {} {{", object, object_type);
        let key = format!("\t{}: ", register);
        let mut offset = 0;
        let mut lines = config.split_inclusive('\n');

        loop {
            let line = lines.next().ok_or_else(|| Error::ObjectNotFound {
                object: object.to_string(),
                path: CONFIG_FILE.into(),
            })?;
            offset += line.len();
            if line.contains(&header) {
                break;
            }
        }

        let start = loop {
            let line = lines.next().ok_or_else(|| register_not_found(register, object))?;
            if line.contains(&key) {
                break offset;
            }
            if line.contains("OBJECT") {
                return Err(register_not_found(register, object));
            }
            offset += line.len();
        };

        let mut end = start;
        let mut depth = 0i64;
        let mut line = &config[start..start + config[start..].find('\n').map_or(config.len() - start, |i| i + 1)];
        loop {
            end += line.len();
            depth += line.matches('(').count() as i64 - line.matches(')').count() as i64;
            if depth <= 0 {
                break;
            }
            line = lines.next().ok_or_else(|| Error::MalformedValue {
                register: register.to_string(),
                message: "unbalanced parentheses".to_string(),
            })?;
        }

        Ok(Self {
            before: config[..start].to_string(),
            entry: config[start..end].to_string(),
            after: config[end..].to_string(),
        })
    }

    /// Parses the attribute into its key and value.
    pub fn parse_entry(&self) -> Result<(String, Value)> {
        let (key, text) = self
            .entry
            .split_once(':')
            .ok_or_else(|| Error::MalformedValue {
                register: self.entry.trim().to_string(),
                message: "missing ':'".to_string(),
            })?;
        let key = key.trim().to_string();
        let value = Value::parse(text).map_err(|message| Error::MalformedValue {
            register: key.clone(),
            message,
        })?;
        Ok((key, value))
    }

    /// Rebuilds the config with `entry` replaced.
    pub fn join(&self, entry: &str) -> String {
        let mut config = String::with_capacity(self.before.len() + entry.len() + self.after.len());
        config.push_str(&self.before);
        config.push_str(entry);
        config.push_str(&self.after);
        config
    }
}

fn register_not_found(register: &str, object: &str) -> Error {
    Error::RegisterNotFound {
        register: register.to_string(),
        object: object.to_string(),
    }
}

/// How the addressed value is changed.
#[derive(Debug, Clone, Copy)]
pub enum Mutation<'a> {
    FlipBit { bit: u32, num_bits: u32 },
    /// Writes a previously recorded injected value.
    Replace(&'a str),
}

/// Result of rewriting one config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedConfig {
    pub config: String,
    pub gold_value: String,
    pub injected_value: String,
}

/// Mutates one scalar or array element of an attribute and returns the new
/// config text. Arrays need an index with one entry per nesting level.
pub fn inject_config(
    config: &str,
    object: &str,
    object_type: &str,
    register: &str,
    index: Option<&[usize]>,
    mutation: Mutation,
) -> Result<InjectedConfig> {
    let split = SplitConfig::split(config, object, object_type, register)?;
    let (key, mut value) = split.parse_entry()?;
    let malformed = |message: String| Error::MalformedValue {
        register: register.to_string(),
        message,
    };

    let index = index.unwrap_or(&[]);
    if index.len() > 3 {
        return Err(Error::TooManyDimensions {
            register: register.to_string(),
            dimensions: index.len(),
        });
    }
    if value.depth() != index.len() {
        return Err(malformed(format!(
            "value has {} dimensions, index has {}",
            value.depth(),
            index.len()
        )));
    }
    let element = value
        .element_mut(index)
        .ok_or_else(|| malformed(format!("index {:?} out of range", index)))?;
    let gold_value = element
        .as_atom()
        .ok_or_else(|| malformed("index does not address a scalar".to_string()))?
        .to_string();
    let injected_value = match mutation {
        Mutation::FlipBit { bit, num_bits } => flip_bit(&gold_value, num_bits, bit).map_err(|e| match e {
            Error::MalformedValue { message, .. } => malformed(message),
            other => other,
        })?,
        Mutation::Replace(recorded) => recorded.to_string(),
    };
    *element = Value::Atom(injected_value.clone());

    Ok(InjectedConfig {
        config: split.join(&value::render(&key, &value)?),
        gold_value,
        injected_value,
    })
}

/// Object block name of a target instance, e.g. `DUT_a9x2cpu[1]`.
pub fn object_name(prefix: &str, target_name: &str, target: &Target, index: Option<usize>) -> Result<(String, String)> {
    let (object, object_type) = match (&target.object, &target.object_type) {
        (Some(object), Some(object_type)) => (object, object_type),
        _ => {
            return Err(Error::Catalog(format!(
                "target {} has no checkpoint object",
                target_name
            )))
        }
    };
    let mut name = format!("{}{}", prefix, object);
    if let (Some(index), Some(count)) = (index, target.count) {
        if count > 1 {
            name.push_str(&format!("[{}]", index));
        }
    }
    Ok((name, object_type.clone()))
}

/// Copies the gold checkpoint to `injected`, writing a config produced by
/// `rewrite`. The partially written directory is removed on failure.
pub fn create_injected_checkpoint<F>(gold: &Path, injected: &Path, rewrite: F) -> Result<InjectedConfig>
where
    F: FnOnce(&str) -> Result<InjectedConfig>,
{
    fs::create_dir(injected).map_err(|e| Error::file(injected, e))?;
    let result = (|| -> Result<InjectedConfig> {
        for entry in fs::read_dir(gold).map_err(|e| Error::file(gold, e))? {
            let entry = entry.map_err(|e| Error::file(gold, e))?;
            let path = entry.path();
            if entry.file_name() == CONFIG_FILE || !path.is_file() {
                continue;
            }
            fs::copy(&path, injected.join(entry.file_name())).map_err(|e| Error::file(&path, e))?;
        }
        let gold_config = gold.join(CONFIG_FILE);
        let config = fs::read_to_string(&gold_config).map_err(|e| Error::file(&gold_config, e))?;
        let injected_config = rewrite(&config).map_err(|e| with_path(e, &gold_config))?;
        let target = injected.join(CONFIG_FILE);
        fs::write(&target, &injected_config.config).map_err(|e| Error::file(&target, e))?;
        Ok(injected_config)
    })();
    if result.is_err() {
        let _ = fs::remove_dir_all(injected);
    }
    result
}

fn with_path(error: Error, path: &Path) -> Error {
    match error {
        Error::ObjectNotFound { object, .. } => Error::ObjectNotFound {
            object,
            path: path.to_path_buf(),
        },
        other => other,
    }
}

/// Difference of one register element between two checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RegisterDiff {
    pub object: String,
    pub register: String,
    pub gold_value: String,
    pub monitored_value: String,
}

/// Register values per object block of a checkpoint.
pub type RegisterValues = BTreeMap<String, BTreeMap<String, Value>>;

/// Checkpoint injector driven by a target catalog.
pub struct CheckpointInjector<'a> {
    catalog: &'a Catalog,
    object_prefix: String,
}

impl<'a> CheckpointInjector<'a> {
    pub fn new(catalog: &'a Catalog, object_prefix: impl Into<String>) -> Self {
        Self {
            catalog,
            object_prefix: object_prefix.into(),
        }
    }

    fn object(&self, injection: &InjectionDescriptor) -> Result<(String, String)> {
        let target = self
            .catalog
            .get(&injection.target)
            .ok_or_else(|| Error::Catalog(format!("invalid injection target: {}", injection.target)))?;
        object_name(&self.object_prefix, &injection.target, target, injection.target_index)
    }

    /// Creates `injected` from `gold` with the bit of `injection` flipped.
    pub fn inject(&self, gold: &Path, injected: &Path, injection: &InjectionDescriptor) -> Result<InjectionRecord> {
        let (object, object_type) = self.object(injection)?;
        let register = self.catalog.register(&injection.target, injection.catalog_register())?;
        let mutation = Mutation::FlipBit {
            bit: injection.bit,
            num_bits: injection.num_bits,
        };
        let result = create_injected_checkpoint(gold, injected, |config| {
            inject_config(
                config,
                &object,
                &object_type,
                &injection.register,
                injection.register_index.as_deref(),
                mutation,
            )
        })?;
        info!(
            "Injected {} in {}: {} -> {}",
            injection,
            injected.display(),
            result.gold_value,
            result.injected_value
        );
        Ok(InjectionRecord {
            descriptor: injection.clone(),
            gold_value: result.gold_value,
            injected_value: result.injected_value,
            processor_mode: None,
            register_access: register.access.clone(),
            success: true,
        })
    }

    /// Recreates a previously injected checkpoint from its record. The
    /// recorded injected value is written verbatim.
    pub fn regenerate(&self, gold: &Path, injected: &Path, record: &InjectionRecord) -> Result<InjectionRecord> {
        let injection = &record.descriptor;
        let (object, object_type) = self.object(injection)?;
        let result = create_injected_checkpoint(gold, injected, |config| {
            inject_config(
                config,
                &object,
                &object_type,
                &injection.register,
                injection.register_index.as_deref(),
                Mutation::Replace(&record.injected_value),
            )
        })?;
        debug!("Regenerated {} in {}", injection, injected.display());
        Ok(InjectionRecord {
            gold_value: result.gold_value,
            ..record.clone()
        })
    }

    /// Reads the values of all catalog registers of every checkpoint object.
    /// TLB and cache targets are not compared and skipped.
    pub fn read_registers(&self, config: &str) -> Result<RegisterValues> {
        let mut values = RegisterValues::new();
        for (name, target) in self.catalog.targets() {
            if target.object.is_none()
                || target.cache.is_some()
                || target.registers.values().any(|r| r.is_tlb)
            {
                continue;
            }
            let instances: Vec<Option<usize>> = match target.count {
                Some(count) => (0..count).map(Some).collect(),
                None => vec![None],
            };
            for instance in instances {
                let (object, object_type) = object_name(&self.object_prefix, name, target, instance)?;
                let registers = read_object(config, &object, &object_type, target)?;
                values.entry(object).or_default().extend(registers);
            }
        }
        Ok(values)
    }

    /// Lists every register element that differs between two checkpoints.
    pub fn compare_registers(&self, gold: &Path, monitored: &Path) -> Result<Vec<RegisterDiff>> {
        let read = |dir: &Path| -> Result<RegisterValues> {
            let path = dir.join(CONFIG_FILE);
            let config = fs::read_to_string(&path).map_err(|e| Error::file(&path, e))?;
            self.read_registers(&config).map_err(|e| with_path(e, &path))
        };
        let gold_values = read(gold)?;
        let monitored_values = read(monitored)?;
        Ok(compare_values(&gold_values, &monitored_values))
    }
}

fn read_object(config: &str, object: &str, object_type: &str, target: &Target) -> Result<BTreeMap<String, Value>> {
    let header = format!("OBJECT {} TYPE {} {{", object, object_type);
    let mut lines = config.lines();
    if !lines.by_ref().any(|line| line.contains(&header)) {
        return Err(Error::ObjectNotFound {
            object: object.to_string(),
            path: CONFIG_FILE.into(),
        });
    }

    let mut registers = BTreeMap::new();
    while let Some(line) = lines.next() {
        if line.contains("OBJECT") {
            break;
        }
        let Some((key, text)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if !target.registers.contains_key(key) {
            continue;
        }
        let mut text = text.to_string();
        let mut depth = text.matches('(').count() as i64 - text.matches(')').count() as i64;
        while depth > 0 {
            let next = lines.next().ok_or_else(|| Error::MalformedValue {
                register: key.to_string(),
                message: "unbalanced parentheses".to_string(),
            })?;
            depth += next.matches('(').count() as i64 - next.matches(')').count() as i64;
            text.push_str(next);
        }
        let value = Value::parse(&text).map_err(|message| Error::MalformedValue {
            register: key.to_string(),
            message,
        })?;
        if value.depth() > 3 {
            return Err(Error::TooManyDimensions {
                register: key.to_string(),
                dimensions: value.depth(),
            });
        }
        registers.insert(key.to_string(), value);
    }

    // Aliases name banked registers that the snapshot stores under their own key.
    if let Some(missing) = target
        .registers
        .iter()
        .find(|(k, r)| r.alias.is_none() && !registers.contains_key(*k))
        .map(|(k, _)| k)
    {
        return Err(register_not_found(missing, object));
    }
    Ok(registers)
}

/// Element-wise difference of two register sets.
pub fn compare_values(gold: &RegisterValues, monitored: &RegisterValues) -> Vec<RegisterDiff> {
    let mut diffs = Vec::new();
    for (object, registers) in gold {
        let Some(monitored_registers) = monitored.get(object) else {
            continue;
        };
        for (register, gold_value) in registers {
            let Some(monitored_value) = monitored_registers.get(register) else {
                continue;
            };
            let monitored_leaves = monitored_value.leaves();
            for ((path, gold_leaf), (_, monitored_leaf)) in gold_value.leaves().into_iter().zip(monitored_leaves) {
                if gold_leaf != monitored_leaf {
                    diffs.push(RegisterDiff {
                        object: object.clone(),
                        register: format!("{}{}", register, path),
                        gold_value: gold_leaf.to_string(),
                        monitored_value: monitored_leaf.to_string(),
                    });
                }
            }
        }
    }
    diffs
}
