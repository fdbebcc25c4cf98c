//! Supplier list ingestion.
//!
//! Suppliers deliver per-country credential lists, one endpoint per line
//! in `host:port:user:pass` form. Malformed lines are skipped and logged,
//! never fatal; a partially usable list is still a usable list.

use crate::resource::ResourceSpec;
use avy_core::ProxyProtocol;
use tracing::warn;

/// Parse a supplier list for one country.
///
/// Blank lines and `#` comments are ignored. A line with the wrong field
/// count or an unusable port (unparseable or zero) is skipped with a
/// warning.
pub fn parse_supplier_list(country: &str, protocol: ProxyProtocol, input: &str) -> Vec<ResourceSpec> {
    let mut specs = Vec::new();

    for (line_no, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            warn!(
                country,
                line = line_no + 1,
                fields = fields.len(),
                "Skipping malformed supplier line: expected host:port:user:pass"
            );
            continue;
        }

        let port: u16 = match fields[1].parse() {
            Ok(p) if p != 0 => p,
            _ => {
                warn!(
                    country,
                    line = line_no + 1,
                    port = fields[1],
                    "Skipping supplier line with invalid port"
                );
                continue;
            }
        };

        if fields[0].is_empty() {
            warn!(country, line = line_no + 1, "Skipping supplier line with empty host");
            continue;
        }

        specs.push(ResourceSpec {
            host: fields[0].to_string(),
            port,
            username: fields[2].to_string(),
            password: fields[3].to_string(),
            protocol,
            country_hint: country.to_string(),
        });
    }

    specs
}
