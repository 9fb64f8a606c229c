use crate::config::AwsConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by the object store
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("Object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// What the object store knows about an uploaded object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub e_tag: Option<String>,
}

/// Read access to uploaded objects
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Confirm that the object exists and fetch its metadata
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, ObjectError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 client
    pub async fn new(config: &AwsConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.s3_endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 object store initialized");

        Self { client }
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, ObjectError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => {
                debug!(size_bytes = output.content_length().unwrap_or_default(), "Object found");
                Ok(ObjectInfo {
                    size_bytes: output.content_length().unwrap_or_default(),
                    content_type: output.content_type().map(String::from),
                    e_tag: output.e_tag().map(String::from),
                })
            }
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Err(ObjectError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    })
                } else {
                    Err(ObjectError::Unavailable(e.to_string()))
                }
            }
        }
    }
}
