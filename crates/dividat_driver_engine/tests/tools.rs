use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
  std::env::temp_dir().join(format!("dividat-driver-test-{}-{}", std::process::id(), name))
}

#[tokio::test]
async fn test_replay_writes_decoded_payloads_in_order() {
  let input = temp_path("replay-input");
  let target = temp_path("replay-target");
  tokio::fs::write(&input, "0,AQI=\n\n10,Aw==\n")
    .await
    .expect("Can write recording");
  tokio::fs::write(&target, b"").await.expect("Can create target");

  dividat_driver_engine::tools::replay(&input, &target, 100.0)
    .await
    .expect("Replay succeeds");

  let written = tokio::fs::read(&target).await.expect("Can read target");
  assert_eq!(written, vec![1, 2, 3]);

  let _ = tokio::fs::remove_file(&input).await;
  let _ = tokio::fs::remove_file(&target).await;
}

#[tokio::test]
async fn test_replay_rejects_malformed_recording() {
  let input = temp_path("replay-bad-input");
  let target = temp_path("replay-bad-target");
  tokio::fs::write(&input, "nonsense line\n")
    .await
    .expect("Can write recording");
  tokio::fs::write(&target, b"").await.expect("Can create target");

  assert!(
    dividat_driver_engine::tools::replay(&input, &target, 1.0)
      .await
      .is_err()
  );

  let _ = tokio::fs::remove_file(&input).await;
  let _ = tokio::fs::remove_file(&target).await;
}
