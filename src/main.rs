use spectrogram_classifier::{run_pipeline, AppConfig};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn setup_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("ログの初期化に失敗しました: {}", e);
    }
}

fn main() {
    setup_logging();

    let config = AppConfig::load_or_default(AppConfig::default_path());

    match run_pipeline(&config) {
        Ok(summary) => {
            tracing::info!(
                "完了: 変換 {} 件, スキップ {} 件, 失敗 {} 件 / 予測: {}",
                summary.preparation.total_converted(),
                summary.preparation.total_skipped(),
                summary.preparation.total_failed(),
                summary.prediction.label
            );
        }
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
