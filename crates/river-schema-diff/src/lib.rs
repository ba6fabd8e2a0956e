// river-schema-diff: offline compatibility checker for serialized service
// registries.
//
// Consumes two registry documents (the `serialize()` output of a service
// registry: services -> procedures -> { kind, init, input?, output, error })
// and reports the changes that would break an old peer talking to a new
// one. Direction decides what breaks: request payloads (init/input, client
// to server) break when the acceptable set narrows; response payloads
// (output/error, server to client) break when the produced set widens.

use serde::Serialize;
use serde_json::Value;

/// Which way a payload flows, and therefore which changes break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// init/input: the new server must accept everything old clients send.
    Request,
    /// output/error: old clients must understand everything the new server
    /// sends.
    Response,
}

/// One breaking change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakage {
    pub service: String,
    /// Absent for service-level breakages.
    pub procedure: Option<String>,
    /// Dotted path into the schema document, e.g. `init.properties.n`.
    pub path: String,
    pub kind: BreakageKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakageKind {
    RemovedService,
    RemovedProcedure,
    KindChanged,
    TypeChanged,
    RequiredFieldAdded,
    RequiredFieldRemoved,
    UnionVariantAdded,
    UnionVariantRemoved,
    ArrayBoundsTightened,
    ArrayBoundsLoosened,
    StructShapeChanged,
    LiteralChanged,
}

impl std::fmt::Display for Breakage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.service)?;
        if let Some(procedure) = &self.procedure {
            write!(f, ".{procedure}")?;
        }
        if !self.path.is_empty() {
            write!(f, " [{}]", self.path)?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Compare two serialized registries. Returns every breaking change, in
/// document order; an empty report means the new registry can serve old
/// clients.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Vec<Breakage> {
    let mut report = Vec::new();
    let empty = serde_json::Map::new();
    let old_services = old["services"].as_object().unwrap_or(&empty);
    let new_services = new["services"].as_object().unwrap_or(&empty);

    for (service_name, old_service) in old_services {
        let Some(new_service) = new_services.get(service_name) else {
            report.push(Breakage {
                service: service_name.clone(),
                procedure: None,
                path: String::new(),
                kind: BreakageKind::RemovedService,
                detail: format!("service `{service_name}` no longer exists"),
            });
            continue;
        };
        diff_service(service_name, old_service, new_service, &mut report);
    }
    report
}

fn diff_service(service: &str, old: &Value, new: &Value, report: &mut Vec<Breakage>) {
    let empty = serde_json::Map::new();
    let old_procedures = old["procedures"].as_object().unwrap_or(&empty);
    let new_procedures = new["procedures"].as_object().unwrap_or(&empty);

    for (proc_name, old_proc) in old_procedures {
        let Some(new_proc) = new_procedures.get(proc_name) else {
            report.push(Breakage {
                service: service.to_owned(),
                procedure: Some(proc_name.clone()),
                path: String::new(),
                kind: BreakageKind::RemovedProcedure,
                detail: format!("procedure `{proc_name}` no longer exists"),
            });
            continue;
        };

        if old_proc["kind"] != new_proc["kind"] {
            report.push(Breakage {
                service: service.to_owned(),
                procedure: Some(proc_name.clone()),
                path: "kind".to_owned(),
                kind: BreakageKind::KindChanged,
                detail: format!(
                    "procedure shape changed from {} to {}",
                    old_proc["kind"], new_proc["kind"]
                ),
            });
            continue;
        }

        let payloads = [
            ("init", Direction::Request),
            ("input", Direction::Request),
            ("output", Direction::Response),
            ("error", Direction::Response),
        ];
        for (field, direction) in payloads {
            let (old_schema, new_schema) = (&old_proc[field], &new_proc[field]);
            if old_schema.is_null() && new_schema.is_null() {
                continue;
            }
            let mut ctx = DiffCtx {
                service,
                procedure: proc_name,
                direction,
                report: &mut *report,
            };
            diff_schema(&mut ctx, field, old_schema, new_schema);
        }
    }
}

struct DiffCtx<'a> {
    service: &'a str,
    procedure: &'a str,
    direction: Direction,
    report: &'a mut Vec<Breakage>,
}

impl DiffCtx<'_> {
    fn push(&mut self, path: &str, kind: BreakageKind, detail: String) {
        self.report.push(Breakage {
            service: self.service.to_owned(),
            procedure: Some(self.procedure.to_owned()),
            path: path.to_owned(),
            kind,
            detail,
        });
    }
}

fn diff_schema(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    // A payload schema dropped or introduced wholesale is a shape change.
    if old.is_null() != new.is_null() {
        ctx.push(
            path,
            BreakageKind::StructShapeChanged,
            "schema added or removed".to_owned(),
        );
        return;
    }

    diff_literals(ctx, path, old, new);
    diff_types(ctx, path, old, new);
    diff_unions(ctx, path, old, new);
    diff_required(ctx, path, old, new);
    diff_array_bounds(ctx, path, old, new);
    diff_struct_shape(ctx, path, old, new);

    // Recurse into properties present on both sides.
    if let (Some(old_props), Some(new_props)) =
        (old["properties"].as_object(), new["properties"].as_object())
    {
        for (key, old_prop) in old_props {
            if let Some(new_prop) = new_props.get(key) {
                let child = format!("{path}.properties.{key}");
                diff_schema(ctx, &child, old_prop, new_prop);
            }
        }
    }
    if let (Some(old_items), Some(new_items)) = (old.get("items"), new.get("items")) {
        if old_items.is_object() && new_items.is_object() {
            let child = format!("{path}.items");
            diff_schema(ctx, &child, old_items, new_items);
        }
    }
}

fn diff_literals(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    let (Some(old_const), Some(new_const)) = (old.get("const"), new.get("const")) else {
        return;
    };
    if old_const != new_const {
        ctx.push(
            path,
            BreakageKind::LiteralChanged,
            format!("literal changed from {old_const} to {new_const}"),
        );
    }
}

fn diff_types(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    let (Some(old_type), Some(new_type)) = (old.get("type"), new.get("type")) else {
        return;
    };
    if old_type != new_type {
        ctx.push(
            path,
            BreakageKind::TypeChanged,
            format!("type changed from {old_type} to {new_type}"),
        );
    }
}

fn union_variants(schema: &Value) -> Option<&Vec<Value>> {
    schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array)
}

fn diff_unions(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    let (Some(old_variants), Some(new_variants)) = (union_variants(old), union_variants(new))
    else {
        return;
    };
    match ctx.direction {
        // An old client may still send a removed variant.
        Direction::Request => {
            for variant in old_variants {
                if !new_variants.contains(variant) {
                    ctx.push(
                        path,
                        BreakageKind::UnionVariantRemoved,
                        format!("request union lost variant {variant}"),
                    );
                }
            }
        }
        // An old client cannot understand a variant it never knew.
        Direction::Response => {
            for variant in new_variants {
                if !old_variants.contains(variant) {
                    ctx.push(
                        path,
                        BreakageKind::UnionVariantAdded,
                        format!("response union gained variant {variant}"),
                    );
                }
            }
        }
    }
}

fn required_fields(schema: &Value) -> Vec<&str> {
    schema["required"]
        .as_array()
        .map(|fields| fields.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn diff_required(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    let old_required = required_fields(old);
    let new_required = required_fields(new);
    match ctx.direction {
        // Old clients do not send a field that became required.
        Direction::Request => {
            for field in &new_required {
                if !old_required.contains(field) {
                    ctx.push(
                        path,
                        BreakageKind::RequiredFieldAdded,
                        format!("request now requires `{field}`"),
                    );
                }
            }
        }
        // Old clients rely on a field that is no longer guaranteed.
        Direction::Response => {
            for field in &old_required {
                if !new_required.contains(field) {
                    ctx.push(
                        path,
                        BreakageKind::RequiredFieldRemoved,
                        format!("response no longer guarantees `{field}`"),
                    );
                }
            }
        }
    }
}

fn diff_array_bounds(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    let old_min = old["minItems"].as_u64().unwrap_or(0);
    let new_min = new["minItems"].as_u64().unwrap_or(0);
    let old_max = old["maxItems"].as_u64().unwrap_or(u64::MAX);
    let new_max = new["maxItems"].as_u64().unwrap_or(u64::MAX);
    if old_min == new_min && old_max == new_max {
        return;
    }
    let tightened = new_min > old_min || new_max < old_max;
    let loosened = new_min < old_min || new_max > old_max;
    match ctx.direction {
        // Old clients may send arrays the tightened bound now rejects.
        Direction::Request if tightened => ctx.push(
            path,
            BreakageKind::ArrayBoundsTightened,
            format!("request bounds tightened to [{new_min}, {new_max}]"),
        ),
        // The server may now send arrays old clients reject.
        Direction::Response if loosened => ctx.push(
            path,
            BreakageKind::ArrayBoundsLoosened,
            format!("response bounds loosened to [{new_min}, {new_max}]"),
        ),
        _ => {}
    }
}

/// A closed object (properties) swapped with an open record
/// (additionalProperties), or vice versa. Breaking both ways.
fn diff_struct_shape(ctx: &mut DiffCtx<'_>, path: &str, old: &Value, new: &Value) {
    let old_is_record = old.get("additionalProperties").is_some_and(Value::is_object);
    let new_is_record = new.get("additionalProperties").is_some_and(Value::is_object);
    let old_is_struct = old.get("properties").is_some();
    let new_is_struct = new.get("properties").is_some();
    if (old_is_record && new_is_struct && !new_is_record)
        || (old_is_struct && new_is_record && !new_is_struct)
    {
        ctx.push(
            path,
            BreakageKind::StructShapeChanged,
            "record/object shape swapped".to_owned(),
        );
    }
}
