use clap::Parser;
use mongo_initial_sync::{
    AllDatabaseCloner, CloneConfig, Cloner, MongoSourceClient, MongoStorage, SourceClient,
    SyncSharedData, SystemClock,
};
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Clone every database from a sync source into local storage")]
struct Opts {
    /// configuration file path.
    #[arg(short, long, default_value = "config.toml")]
    conf: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let data = std::fs::read_to_string(&opts.conf)?;
    let conf: CloneConfig = toml::from_str(&data)?;

    let mut client = MongoSourceClient::new(conf.get_src_url());
    client.connect()?;
    let fcv = client.fetch_feature_compatibility_version()?;
    let rollback_id = client.fetch_rollback_id()?;
    info!(fcv = %fcv, rollback_id, "Connected to the sync source. ");

    let shared = Arc::new(SyncSharedData::new(
        fcv,
        rollback_id,
        conf.transient_retry_period(),
    ));
    let storage = Arc::new(MongoStorage::connect(conf.get_target_url())?);
    let pool = Arc::new(
        ThreadPoolBuilder::new()
            .num_threads(conf.get_worker_threads())
            .build()?,
    );

    let mut cloner = AllDatabaseCloner::new(
        Arc::clone(&shared),
        conf.get_src_url().to_string(),
        Box::new(client),
        storage,
        pool,
        Arc::new(SystemClock),
        conf.get_batch_size(),
    );
    let result = cloner.run();
    let stats = cloner.stats();
    println!("{}", stats.to_document());
    result?;
    info!("Initial sync clone complete. ");
    Ok(())
}
