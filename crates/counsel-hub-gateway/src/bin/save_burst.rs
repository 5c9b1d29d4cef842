//! Save burst: concurrent staff sessions generating and saving against a running gateway.
//! Checks that every successful save lands as exactly one Hub row.
//! Run with gateway up: cargo run --bin save_burst
//! Env: COUNSEL_HUB_URL (default http://127.0.0.1:8000), COUNSEL_HUB_PASSWORD.

use reqwest::Client;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

const CONCURRENT_STAFF: usize = 6;
const SAVES_PER_STAFF: usize = 4;

const OBSERVATIONS: &[&str] = &[
    "下課時與同學在走廊推擠，事後情緒低落，表示不想再來學校。",
    "月考成績下滑，自述每天讀書到凌晨兩點，仍覺得跟不上。",
    "家長來電表示孩子近一週晚歸，回家後不願溝通。",
    "上課時多次趴睡，詢問後表示家中最近有爭吵。",
    "主動來談，想了解高職與普高的差別，對未來感到迷惘。",
];

const CATEGORIES: &[&str] = &[
    "interpersonal_conflict",
    "academic_stress",
    "family_issue",
    "emotional_distress",
    "career_planning",
];

async fn login(client: &Client, base: &str, password: &str) -> Result<String, String> {
    let resp = client
        .post(format!("{}/api/login", base))
        .json(&json!({ "password": password }))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("login failed: {}", resp.status()));
    }
    let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
    body["token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| "login reply without token".to_string())
}

fn history_request(client: &Client, base: &str, token: &str, student_id: &str) -> reqwest::RequestBuilder {
    client
        .get(format!("{}/api/records/history", base))
        .query(&[("student_id", student_id)])
        .header("x-session-token", token)
}

async fn generate_and_save(
    client: &Client,
    base: &str,
    token: &str,
    student_id: &str,
    idx: usize,
) -> Result<(), String> {
    let form = json!({
        "target_type": if idx % 3 == 0 { "parent" } else { "student" },
        "student_id": student_id,
        "category": CATEGORIES[idx % CATEGORIES.len()],
        "observation": OBSERVATIONS[idx % OBSERVATIONS.len()],
    });
    let resp = client
        .post(format!("{}/api/narrative", base))
        .header("x-session-token", token)
        .json(&form)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("generate: {}", resp.status()));
    }
    let resp = client
        .post(format!("{}/api/records", base))
        .header("x-session-token", token)
        .json(&json!({}))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("save: {}", resp.status()));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let base = std::env::var("COUNSEL_HUB_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".into());
    let password = std::env::var("COUNSEL_HUB_PASSWORD").unwrap_or_default();
    let run_tag = format!("BURST{}", std::process::id());

    println!(
        "[SAVE BURST] {} staff × {} saves = {} records (student ids {}-*)",
        CONCURRENT_STAFF,
        SAVES_PER_STAFF,
        CONCURRENT_STAFF * SAVES_PER_STAFF,
        run_tag
    );
    println!("[SAVE BURST] Target: {} (ensure gateway is running)", base);

    let success = Arc::new(AtomicU32::new(0));
    let failure = Arc::new(AtomicU32::new(0));
    let latencies: Arc<RwLock<Vec<u64>>> = Arc::new(RwLock::new(Vec::new()));
    let client = Client::new();

    let mut handles = Vec::new();
    for staff in 0..CONCURRENT_STAFF {
        let client = client.clone();
        let base = base.clone();
        let password = password.clone();
        let student_id = format!("{}-{}", run_tag, staff);
        let success = Arc::clone(&success);
        let failure = Arc::clone(&failure);
        let latencies = Arc::clone(&latencies);

        handles.push(tokio::spawn(async move {
            let token = match login(&client, &base, &password).await {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("[SAVE BURST] staff {}: {}", staff, e);
                    failure.fetch_add(SAVES_PER_STAFF as u32, Ordering::Relaxed);
                    return;
                }
            };
            for r in 0..SAVES_PER_STAFF {
                let start = Instant::now();
                match generate_and_save(&client, &base, &token, &student_id, staff + r).await {
                    Ok(()) => {
                        success.fetch_add(1, Ordering::Relaxed);
                        latencies.write().await.push(start.elapsed().as_millis() as u64);
                    }
                    Err(e) => {
                        eprintln!("[SAVE BURST] staff {} save {}: {}", staff, r, e);
                        failure.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let s = success.load(Ordering::Relaxed);
    let f = failure.load(Ordering::Relaxed);
    let latencies_guard = latencies.read().await;
    let avg_latency_ms = if latencies_guard.is_empty() {
        0.0
    } else {
        latencies_guard.iter().sum::<u64>() as f64 / latencies_guard.len() as f64
    };
    println!(
        "[SAVE BURST] Saved: {} | Failed: {} | Average generate+save: {:.0}ms",
        s, f, avg_latency_ms
    );

    // Every successful save must be exactly one row.
    let mut found = 0usize;
    match login(&client, &base, &password).await {
        Ok(token) => {
            for staff in 0..CONCURRENT_STAFF {
                let student_id = format!("{}-{}", run_tag, staff);
                let count = match history_request(&client, &base, &token, &student_id).send().await {
                    Ok(resp) => resp
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v["count"].as_u64())
                        .unwrap_or(0),
                    Err(_) => 0,
                };
                found += count as usize;
            }
        }
        Err(e) => eprintln!("[SAVE BURST] verification login: {}", e),
    }

    if found == s as usize {
        println!("[SAVE BURST] Hub rows match saves: {}", found);
    } else {
        println!("[SAVE BURST] MISMATCH: {} saves reported, {} rows found", s, found);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_query_encodes_the_student_id() {
        let client = Client::new();
        let req = history_request(&client, "http://127.0.0.1:8000", "tok", "A&B 1#x")
            .build()
            .unwrap();
        assert_eq!(req.url().path(), "/api/records/history");
        assert_eq!(req.url().query(), Some("student_id=A%26B+1%23x"));
        let pairs: Vec<(String, String)> = req.url().query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("student_id".to_string(), "A&B 1#x".to_string())]);
    }
}
