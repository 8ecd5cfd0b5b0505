use diesel::r2d2;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::Pool;
use diesel::PgConnection;
use gateway_channels::run_migration;
use testcontainers::clients::Cli;
use testcontainers::core::WaitFor;
use testcontainers::images::generic::GenericImage;
use testcontainers::Container;

pub fn start_postgres(docker: &Cli) -> anyhow::Result<(Container<GenericImage>, String)> {
    let db = "gateway-channels-test";
    let user = "gateway-channels-test";
    let password = "gateway-channels-test";

    let postgres = GenericImage::new("postgres", "15-alpine")
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_DB", db)
        .with_env_var("POSTGRES_USER", user)
        .with_env_var("POSTGRES_PASSWORD", password);

    let node = docker.run(postgres);

    let connection_string = format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        user,
        password,
        node.get_host_port_ipv4(5432),
        db
    );

    Ok((node, connection_string))
}

pub fn build_pool(conn_spec: &str) -> Pool<ConnectionManager<PgConnection>> {
    let manager = ConnectionManager::<PgConnection>::new(conn_spec);
    let pool = r2d2::Pool::builder()
        .build(manager)
        .expect("failed to build connection pool");

    let mut conn = pool.get().expect("failed to get connection from pool");
    run_migration(&mut conn);

    pool
}
