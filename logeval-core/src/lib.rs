//! Core library for the logeval log anomaly detection harness: dataset
//! preparation, evaluation against an inference endpoint, and bulk transfer.

pub mod config;
pub mod convert;
pub mod dataset;
pub mod engine;
pub mod evaluation;
pub mod hub;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod prediction;
pub mod records;
pub mod session;
pub mod transfer;

pub use config::AppConfig;
pub use config::AppPaths;
pub use config::ConfigBundle;
pub use config::ResolvedDataset;
pub use config::ResolvedModelConfig;
pub use config::load_or_initialize_config;
pub use convert::ConversionSummary;
pub use convert::convert_hdfs;
pub use convert::materialize;
pub use dataset::BatchLoader;
pub use dataset::EvalDataset;
pub use engine::Harness;
pub use evaluation::EvaluationDriver;
pub use evaluation::EvaluationResult;
pub use evaluation::EvaluationSummary;
pub use evaluation::render_report;
pub use hub::HubDownload;
pub use hub::HubReport;
pub use labels::BlockLabel;
pub use labels::LabelReconciler;
pub use metrics::ConfusionMatrix;
pub use model::AnomalyModel;
pub use model::HttpModel;
pub use model::WeightCheck;
pub use prediction::PredictionLabel;
pub use prediction::parse_prediction;
pub use records::LogRecord;
pub use session::SessionSplit;
pub use session::build_sessions;
pub use transfer::CopyCommand;
pub use transfer::TransferPlan;
pub use transfer::TransferReport;
