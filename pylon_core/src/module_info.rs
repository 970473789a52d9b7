use serde::{Deserialize, Serialize};

/// Logical BMU index reported by `info` and the barcode of the module behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub index: u32,
    pub barcode: String,
}

/// Extracts the module map from the output of the `info` command.
///
/// The console prints a `BMU <n>` line for each logical index, followed at
/// some point by `Module: <barcode>`. A `BMU` line whose index does not parse
/// invalidates the current index until the next good one, so a garbled line
/// never attaches a barcode to the wrong module.
pub fn parse_module_info(raw: &str) -> Vec<ModuleInfo> {
    let mut modules = Vec::new();
    let mut current: Option<u32> = None;

    for line in raw.lines().map(str::trim) {
        if line.starts_with("BMU") {
            current = line
                .split_whitespace()
                .nth(1)
                .and_then(|index| index.parse().ok());
        }

        if let Some(rest) = line.strip_prefix("Module:")
            && let Some(index) = current
        {
            let barcode = rest.trim();
            if !barcode.is_empty() {
                modules.push(ModuleInfo {
                    index,
                    barcode: barcode.to_string(),
                });
            }
        }
    }

    modules
}
