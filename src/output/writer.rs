use std::fs;
use std::io;
use std::path::Path;

use super::schema::InventorySummary;

pub fn write_json(summary: &InventorySummary, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)?;
    Ok(())
}
