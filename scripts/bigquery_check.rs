// Quick diagnostic: test BigQuery credentials and the configured asset tables
// Run: cargo run --bin bigquery_check -- [resource-name]

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let project_id = std::env::var("BIGQUERY_PROJECT_ID").expect("BIGQUERY_PROJECT_ID");
    let dataset_id = std::env::var("BIGQUERY_DATASET_ID").expect("BIGQUERY_DATASET_ID");
    let instances_table = std::env::var("INSTANCES_TABLE_ID").expect("INSTANCES_TABLE_ID");
    let status_table = std::env::var("STATUS_CHECK_TABLE_ID").expect("STATUS_CHECK_TABLE_ID");
    let api_base = std::env::var("BIGQUERY_API_BASE")
        .unwrap_or_else(|_| "https://bigquery.googleapis.com/bigquery/v2".to_string());
    let resource = std::env::args().nth(1);

    let client = reqwest::Client::new();

    // 1. Get access token
    println!("1. Getting access token...");
    let access_token = match std::env::var("BIGQUERY_ACCESS_TOKEN") {
        Ok(token) if !token.is_empty() => {
            println!("   OK. Using BIGQUERY_ACCESS_TOKEN from the environment");
            token
        }
        _ => {
            let resp = client
                .get(METADATA_TOKEN_URL)
                .header("Metadata-Flavor", "Google")
                .send()
                .await;
            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    println!("   FAIL: metadata server unreachable: {}", e);
                    println!("   Outside GCP, set BIGQUERY_ACCESS_TOKEN=$(gcloud auth print-access-token)");
                    return;
                }
            };
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                println!("   FAIL: token request returned {}:\n{}", status, body);
                return;
            }
            let json: serde_json::Value = serde_json::from_str(&body).expect("parse token");
            println!(
                "   OK. Token expires in {}s",
                json["expires_in"].as_u64().unwrap_or(0)
            );
            json["access_token"]
                .as_str()
                .expect("access_token")
                .to_string()
        }
    };

    // 2. Dry-run a scan of each table
    for table in [&instances_table, &status_table] {
        println!(
            "\n2. Dry-running SELECT * FROM {}.{}.{}...",
            project_id, dataset_id, table
        );
        let resp = client
            .post(format!("{}/projects/{}/queries", api_base, project_id))
            .bearer_auth(&access_token)
            .json(&serde_json::json!({
                "query": format!("SELECT * FROM `{}.{}.{}`", project_id, dataset_id, table),
                "useLegacySql": false,
                "dryRun": true,
            }))
            .send()
            .await
            .expect("dry-run request failed");

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            let json: serde_json::Value =
                serde_json::from_str(&body).unwrap_or(serde_json::json!({}));
            let columns: Vec<&str> = json["schema"]["fields"]
                .as_array()
                .map(|fields| fields.iter().filter_map(|f| f["name"].as_str()).collect())
                .unwrap_or_default();
            println!(
                "   OK. Would scan {} bytes",
                json["totalBytesProcessed"].as_str().unwrap_or("?")
            );
            println!("   Columns: {}", columns.join(", "));
        } else {
            println!("   FAIL: {} - {}", status, body);
        }
    }

    // 3. Optional parameterized lookup
    let Some(resource) = resource else {
        println!("\nPass a resource name to also run an instance lookup.");
        return;
    };
    println!("\n3. Looking up '{}' in {}...", resource, instances_table);
    let resp = client
        .post(format!("{}/projects/{}/queries", api_base, project_id))
        .bearer_auth(&access_token)
        .json(&serde_json::json!({
            "query": format!(
                "SELECT instance_id, instance_name, zone, status FROM `{}.{}.{}` \
                 WHERE LOWER(instance_name) = @resource_name LIMIT 5",
                project_id, dataset_id, instances_table
            ),
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": [{
                "name": "resource_name",
                "parameterType": { "type": "STRING" },
                "parameterValue": { "value": resource.to_lowercase() }
            }],
        }))
        .send()
        .await
        .expect("lookup request failed");

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    println!("   Status: {}", status);
    println!("   Body: {}", body);

    if status.is_success() {
        println!("\n   SUCCESS - the service account can query the asset tables.");
    } else {
        println!("\n   FAILED - check the output above.");
    }
}
