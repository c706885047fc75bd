// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Structured result shaping.
//!
//! Known list outputs are condensed into summary entries the model can scan
//! without paging through raw API payloads.  Everything else passes through
//! untouched — the model always sees the full structure; only the socket
//! path truncates fields.

use serde_json::{json, Value};

/// Shape a parsed JSON stdout into the envelope's `data` / `chat_output`
/// contribution.  Returns fields to merge into the response object.
pub fn shape_output(provider: &str, command: &str, parsed: &Value) -> Value {
    if let Value::Array(items) = parsed {
        if !items.is_empty() {
            if command.contains("compute instances") {
                return shape_gcp_instances(items);
            }
            if provider == "ovh" && command.contains("list-flavors") {
                return shape_ovh_flavors(items);
            }
            if provider == "ovh" && command.contains("list-images") {
                return shape_ovh_images(items);
            }
            if provider == "ovh" && command.contains("region list") {
                return shape_ovh_regions(items);
            }
            if provider == "ovh" && items.len() > 20 {
                return shape_large_list(items);
            }
            // Scalar lists render directly into the chat output.
            if items
                .first()
                .map(|v| v.is_string() || v.is_number() || v.is_boolean())
                .unwrap_or(false)
            {
                return json!({
                    "chat_output": serde_json::to_string_pretty(items).unwrap_or_default(),
                });
            }
            return json!({
                "data": {
                    "items": items,
                    "count": items.len(),
                    "summary": format!("Command executed successfully, returned {} items", items.len()),
                }
            });
        }
    }

    if let Value::Object(obj) = parsed {
        if command.contains("ec2 describe-instances") && obj.contains_key("Reservations") {
            return shape_ec2_instances(parsed);
        }
        if command.contains("ecs list-clusters") && obj.contains_key("clusterArns") {
            return shape_ecs_clusters(parsed);
        }
        if command.contains("eks list-clusters") && obj.contains_key("clusters") {
            return shape_eks_clusters(parsed);
        }
    }

    json!({ "data": parsed })
}

fn shape_gcp_instances(items: &[Value]) -> Value {
    let mut summary = Vec::new();
    for instance in items {
        let Some(obj) = instance.as_object() else { continue };
        let tail = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
        };
        let nic = instance["networkInterfaces"].get(0);
        summary.push(json!({
            "name": obj.get("name"),
            "status": obj.get("status"),
            "machineType": tail("machineType"),
            "zone": tail("zone"),
            "externalIP": nic
                .and_then(|n| n["accessConfigs"].get(0))
                .and_then(|a| a.get("natIP"))
                .cloned()
                .unwrap_or(Value::Null),
            "internalIP": nic.and_then(|n| n.get("networkIP")).cloned().unwrap_or(Value::Null),
        }));
    }
    json!({
        "data": {
            "resources": summary,
            "total_count": summary.len(),
            "summary": format!("Found {} compute instances", summary.len()),
        }
    })
}

fn shape_ec2_instances(parsed: &Value) -> Value {
    let mut summary = Vec::new();
    for reservation in parsed["Reservations"].as_array().unwrap_or(&Vec::new()) {
        for instance in reservation["Instances"].as_array().unwrap_or(&Vec::new()) {
            summary.push(json!({
                "instanceId": instance["InstanceId"],
                "state": instance["State"]["Name"],
                "instanceType": instance["InstanceType"],
                "availabilityZone": instance["Placement"]["AvailabilityZone"],
                "publicIP": instance["PublicIpAddress"],
                "privateIP": instance["PrivateIpAddress"],
                "keyName": instance["KeyName"],
                "launchTime": instance["LaunchTime"],
            }));
        }
    }
    json!({
        "data": {
            "resources": summary,
            "total_count": summary.len(),
            "summary": format!("Found {} EC2 instances", summary.len()),
        }
    })
}

fn shape_ecs_clusters(parsed: &Value) -> Value {
    let arns = parsed["clusterArns"].as_array().cloned().unwrap_or_default();
    let summary: Vec<Value> = arns
        .iter()
        .filter_map(Value::as_str)
        .map(|arn| {
            json!({
                "clusterArn": arn,
                "clusterName": arn.rsplit('/').next().unwrap_or(arn),
            })
        })
        .collect();
    json!({
        "data": {
            "resources": summary,
            "total_count": summary.len(),
            "summary": format!("Found {} ECS clusters", summary.len()),
        }
    })
}

fn shape_eks_clusters(parsed: &Value) -> Value {
    let clusters = parsed["clusters"].as_array().cloned().unwrap_or_default();
    let summary: Vec<Value> = clusters
        .iter()
        .filter_map(Value::as_str)
        .map(|name| json!({ "clusterName": name }))
        .collect();
    json!({
        "data": {
            "resources": summary,
            "total_count": summary.len(),
            "summary": format!("Found {} EKS clusters", summary.len()),
        }
    })
}

/// OVH flavor lists run past 100 entries.  Keep the Linux flavors sorted by
/// size, surface the cheapest options with their UUIDs, and warn that the
/// `id` field — not the name — is what instance creation takes.
fn shape_ovh_flavors(items: &[Value]) -> Value {
    const CHEAP_NAMES: &[&str] = &["s1-2", "d2-2", "b2-7", "b2-15"];
    let mut summary: Vec<Value> = Vec::new();
    let mut cheapest: Vec<Value> = Vec::new();

    for flavor in items {
        let Some(obj) = flavor.as_object() else { continue };
        let os_type = obj.get("osType").and_then(Value::as_str).unwrap_or("linux");
        let available = obj.get("available").and_then(Value::as_bool).unwrap_or(true);
        if os_type != "linux" || !available {
            continue;
        }
        let entry = json!({
            "id": obj.get("id"),
            "name": obj.get("name"),
            "vcpus": obj.get("vcpus"),
            "ram": obj.get("ram"),
            "disk": obj.get("disk"),
            "type": obj.get("type"),
        });
        if let Some(name) = obj.get("name").and_then(Value::as_str) {
            if CHEAP_NAMES.contains(&name) {
                cheapest.push(entry.clone());
            }
        }
        summary.push(entry);
    }
    summary.sort_by_key(|e| {
        (
            e["vcpus"].as_u64().unwrap_or(0),
            e["ram"].as_u64().unwrap_or(0),
        )
    });

    let cheapest_info: Vec<String> = cheapest
        .iter()
        .take(3)
        .map(|f| format!("{}: id={}", f["name"].as_str().unwrap_or("?"), f["id"].as_str().unwrap_or("?")))
        .collect();
    let chat_output = if cheapest_info.is_empty() {
        "See data.resources for options".to_string()
    } else {
        format!(
            "Found {} VM flavors.\nIMPORTANT: Use the 'id' field (UUID) for --flavor, NOT the name!\nCheapest options:\n{}",
            items.len(),
            cheapest_info.join("\n")
        )
    };

    json!({
        "data": {
            "resources": summary.iter().take(10).collect::<Vec<_>>(),
            "cheapest_options": cheapest.iter().take(4).collect::<Vec<_>>(),
            "total_count": items.len(),
            "shown_count": summary.len().min(10),
            "summary": format!(
                "Found {} flavors. Use the 'id' field (UUID) for --flavor parameter, NOT the name!",
                items.len()
            ),
        },
        "chat_output": chat_output,
    })
}

fn shape_ovh_images(items: &[Value]) -> Value {
    const DISTROS: &[&str] = &["ubuntu", "debian", "centos", "rocky", "alma"];
    const RECOMMENDED: &[&str] = &["ubuntu 24", "ubuntu 22", "debian 12", "rocky 9"];
    let mut summary: Vec<Value> = Vec::new();
    let mut recommended: Vec<Value> = Vec::new();

    for image in items {
        let Some(obj) = image.as_object() else { continue };
        let Some(name) = obj.get("name").and_then(Value::as_str) else { continue };
        let lower = name.to_ascii_lowercase();
        if !DISTROS.iter().any(|d| lower.contains(d)) {
            continue;
        }
        let entry = json!({ "id": obj.get("id"), "name": name });
        if RECOMMENDED.iter().any(|r| lower.contains(r)) {
            recommended.push(entry.clone());
        }
        summary.push(entry);
    }

    let recommended_info: Vec<String> = recommended
        .iter()
        .take(3)
        .map(|i| format!("{}: id={}", i["name"].as_str().unwrap_or("?"), i["id"].as_str().unwrap_or("?")))
        .collect();
    let chat_output = if recommended_info.is_empty() {
        "See data.resources for options".to_string()
    } else {
        format!(
            "Found {} images.\nIMPORTANT: Use the 'id' field (UUID) for --boot-from.image, NOT the name!\nRecommended:\n{}",
            items.len(),
            recommended_info.join("\n")
        )
    };

    json!({
        "data": {
            "resources": summary.iter().take(8).collect::<Vec<_>>(),
            "recommended": recommended.iter().take(4).collect::<Vec<_>>(),
            "total_count": items.len(),
            "shown_count": summary.len().min(8),
            "summary": format!(
                "Found {} images. Use the 'id' field (UUID) for --boot-from.image, NOT the name!",
                items.len()
            ),
        },
        "chat_output": chat_output,
    })
}

fn shape_ovh_regions(items: &[Value]) -> Value {
    let summary: Vec<Value> = items
        .iter()
        .take(20)
        .map(|region| match region {
            Value::Object(obj) => json!({
                "name": obj.get("name").or_else(|| obj.get("Name")),
                "status": obj.get("status").or_else(|| obj.get("Status")).cloned().unwrap_or(json!("UP")),
                "continent": obj.get("continentCode").or_else(|| obj.get("ContinentCode")),
            }),
            Value::String(s) => json!({ "name": s }),
            other => other.clone(),
        })
        .collect();
    json!({
        "data": {
            "resources": summary,
            "total_count": items.len(),
            "summary": format!("Found {} regions available", items.len()),
        },
        "chat_output": format!(
            "Found {} OVH regions. Common options: GRA7 (France), SBG5 (France), BHS5 (Canada), US-EAST-VA-1 (US)",
            items.len()
        ),
    })
}

fn shape_large_list(items: &[Value]) -> Value {
    json!({
        "data": {
            "items": items.iter().take(20).collect::<Vec<_>>(),
            "total_count": items.len(),
            "shown_count": 20,
            "summary": format!("Found {} items. Showing first 20.", items.len()),
        },
        "chat_output": format!("Found {} items (showing first 20)", items.len()),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcp_instances_condense_to_the_expected_fields() {
        let parsed = json!([{
            "name": "web-1",
            "status": "RUNNING",
            "machineType": "https://compute.googleapis.com/projects/p/zones/us-central1-a/machineTypes/e2-medium",
            "zone": "https://compute.googleapis.com/projects/p/zones/us-central1-a",
            "networkInterfaces": [{
                "networkIP": "10.0.0.2",
                "accessConfigs": [{ "natIP": "34.1.2.3" }],
            }],
        }]);
        let shaped = shape_output("gcp", "gcloud compute instances list --format=json", &parsed);
        let first = &shaped["data"]["resources"][0];
        assert_eq!(first["name"], "web-1");
        assert_eq!(first["machineType"], "e2-medium");
        assert_eq!(first["zone"], "us-central1-a");
        assert_eq!(first["externalIP"], "34.1.2.3");
        assert_eq!(first["internalIP"], "10.0.0.2");
        assert_eq!(shaped["data"]["summary"], "Found 1 compute instances");
    }

    #[test]
    fn ec2_reservations_flatten() {
        let parsed = json!({
            "Reservations": [
                { "Instances": [
                    { "InstanceId": "i-1", "State": {"Name": "running"}, "InstanceType": "t3.micro",
                      "Placement": {"AvailabilityZone": "us-east-1a"}, "PrivateIpAddress": "10.0.0.5" },
                    { "InstanceId": "i-2", "State": {"Name": "stopped"}, "InstanceType": "t3.small",
                      "Placement": {"AvailabilityZone": "us-east-1b"} }
                ]}
            ]
        });
        let shaped = shape_output("aws", "aws ec2 describe-instances --output json", &parsed);
        assert_eq!(shaped["data"]["total_count"], 2);
        assert_eq!(shaped["data"]["resources"][0]["instanceId"], "i-1");
        assert_eq!(shaped["data"]["resources"][1]["state"], "stopped");
    }

    #[test]
    fn ecs_cluster_arns_gain_names() {
        let parsed = json!({ "clusterArns": ["arn:aws:ecs:us-east-1:1:cluster/prod-main"] });
        let shaped = shape_output("aws", "aws ecs list-clusters", &parsed);
        assert_eq!(shaped["data"]["resources"][0]["clusterName"], "prod-main");
    }

    #[test]
    fn ovh_flavors_surface_cheapest_with_uuid_warning() {
        let flavors: Vec<Value> = (0..30)
            .map(|i| {
                json!({
                    "id": format!("uuid-{i}"),
                    "name": if i == 0 { "b2-7".to_string() } else { format!("c2-{i}") },
                    "vcpus": 2, "ram": 7000, "disk": 50, "type": "ovh.ssd",
                    "osType": "linux", "available": true,
                })
            })
            .collect();
        let shaped = shape_output("ovh", "ovhcloud reference list-flavors --json", &json!(flavors));
        assert_eq!(shaped["data"]["total_count"], 30);
        assert_eq!(shaped["data"]["cheapest_options"][0]["name"], "b2-7");
        assert!(shaped["chat_output"].as_str().unwrap().contains("NOT the name"));
        assert!(shaped["data"]["resources"].as_array().unwrap().len() <= 10);
    }

    #[test]
    fn ovh_images_recommend_current_distros() {
        let images = json!([
            { "id": "u24", "name": "Ubuntu 24.04" },
            { "id": "w22", "name": "Windows Server 2022" },
            { "id": "d12", "name": "Debian 12" },
        ]);
        let shaped = shape_output("ovh", "ovhcloud reference list-images --json", &images);
        let recommended = shaped["data"]["recommended"].as_array().unwrap();
        assert_eq!(recommended.len(), 2);
        // Windows images are filtered from the resource list.
        assert_eq!(shaped["data"]["resources"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn large_ovh_lists_are_capped_at_twenty() {
        let items: Vec<Value> = (0..45).map(|i| json!({"k": i})).collect();
        let shaped = shape_output("ovh", "ovhcloud cloud something list --json", &json!(items));
        assert_eq!(shaped["data"]["shown_count"], 20);
        assert_eq!(shaped["data"]["total_count"], 45);
    }

    #[test]
    fn scalar_lists_render_as_chat_output() {
        let parsed = json!(["a", "b", "c"]);
        let shaped = shape_output("gcp", "gcloud projects list --format=json", &parsed);
        assert!(shaped["chat_output"].as_str().unwrap().contains("\"b\""));
        assert!(shaped.get("data").is_none());
    }

    #[test]
    fn unknown_objects_pass_through() {
        let parsed = json!({"custom": {"nested": true}});
        let shaped = shape_output("gcp", "gcloud something describe", &parsed);
        assert_eq!(shaped["data"]["custom"]["nested"], true);
    }
}
