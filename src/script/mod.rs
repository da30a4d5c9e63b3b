//! Scripted load generation: a Lua program drives the adapter contract.
//!
//! Each worker owns its own Lua state running the same compiled source.
//! The script's optional `args(argv)` function is evaluated exactly once,
//! with the global table frozen so nothing leaks between workers, and its
//! returned options table is re-materialized read-only in every state. The
//! `init`/`tick`/`finish` globals then mirror the adapter lifecycle; a
//! non-nil return from `tick` retires the worker.

pub mod api;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Table, UserData, UserDataMethods, Variadic};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::generator::{Generator, WorkerContext};
use crate::protocols::clickhouse::{ClickhouseGenerator, ClickhouseOptions};
use crate::protocols::cql::{CqlGenerator, CqlOptions};
use crate::protocols::grpc::{GrpcGenerator, GrpcOptions};
use crate::protocols::http::{HttpGenerator, HttpOptions};
use crate::protocols::kafka::{KafkaGenerator, KafkaOptions};
use crate::protocols::mongo::{MongoGenerator, MongoOptions};
use crate::protocols::mysql::{MysqlGenerator, MysqlOptions};
use crate::protocols::psql::{PsqlGenerator, PsqlOptions};
use crate::protocols::redis::{RedisGenerator, RedisOptions};
use crate::protocols::smtp::{SmtpGenerator, SmtpOptions};
use crate::share::ClientShare;
use crate::stats::{TraceKind, TraceRecord};
use api::{SharedMap, TickData, TickDataFeed};

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    pub script: PathBuf,
    pub args: Vec<String>,
}

/// State shared by every worker running the same script.
pub struct ScriptRuntime {
    script: PathBuf,
    script_dir: PathBuf,
    args: Vec<String>,
    source: String,
    frozen_args: tokio::sync::Mutex<Option<serde_json::Value>>,
    pub shared_map: SharedMap,
    pub tick_data: TickDataFeed,
    grpc_share: Arc<ClientShare<tonic::transport::Channel>>,
    cql_share: Arc<ClientShare<Arc<scylla::Session>>>,
}

impl ScriptRuntime {
    pub fn load(options: ScriptOptions) -> anyhow::Result<Arc<Self>> {
        let source = std::fs::read_to_string(&options.script)
            .with_context(|| format!("cannot read script {}", options.script.display()))?;
        let script_dir = std::path::absolute(&options.script)
            .unwrap_or_else(|_| options.script.clone())
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Arc::new(Self {
            script: options.script,
            script_dir,
            args: options.args,
            source,
            frozen_args: tokio::sync::Mutex::new(None),
            shared_map: SharedMap::default(),
            tick_data: TickDataFeed::default(),
            grpc_share: Arc::new(ClientShare::new()),
            cql_share: Arc::new(ClientShare::new()),
        }))
    }
}

pub struct ScriptGenerator {
    context: WorkerContext,
    runtime: Arc<ScriptRuntime>,
    lua: Option<Lua>,
    tick_fn: Option<RegistryKey>,
    finish_fn: Option<RegistryKey>,
    started: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ScriptGenerator {
    pub fn new(context: WorkerContext, runtime: Arc<ScriptRuntime>) -> Self {
        Self {
            context,
            runtime,
            lua: None,
            tick_fn: None,
            finish_fn: None,
            started: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Evaluate `args(argv)` in a throwaway state. The global table is
    /// frozen first so the args phase cannot smuggle state into workers.
    async fn evaluate_args(&self) -> anyhow::Result<serde_json::Value> {
        let lua = Lua::new();
        self.install_api(&lua, &serde_json::Value::Object(Default::default()))?;
        lua.load(&self.runtime.source)
            .set_name(self.runtime.script.display().to_string())
            .exec_async()
            .await
            .map_err(|err| anyhow::anyhow!("lua: execution failed: {err}"))?;

        let globals = lua.globals();
        let args_fn: mlua::Value = globals.get("args")?;
        match args_fn {
            mlua::Value::Nil => Ok(serde_json::Value::Object(Default::default())),
            mlua::Value::Function(function) => {
                freeze_table(&lua, &globals)?;
                let argv = lua.create_table()?;
                for (i, arg) in self.runtime.args.iter().enumerate() {
                    argv.set(i + 1, arg.clone())?;
                }
                let ret: mlua::Value = function
                    .call_async(argv)
                    .await
                    .map_err(|err| anyhow::anyhow!("args function execution failed: {err}"))?;
                if let mlua::Value::Table(_) = ret {
                    Ok(lua.from_value(ret)?)
                } else {
                    anyhow::bail!(
                        "args function must return a table but returned: {}",
                        ret.type_name()
                    )
                }
            }
            other => anyhow::bail!("lua: \"args\" is not a function ({})", other.type_name()),
        }
    }

    fn install_api(&self, lua: &Lua, args_snapshot: &serde_json::Value) -> anyhow::Result<()> {
        let lg = lua.create_table()?;
        lg.set("id", self.context.id)?;
        lg.set("concurrency", self.context.concurrency)?;
        lg.set("request_rate", self.context.requestrate)?;
        lg.set("script_dir", self.runtime.script_dir.display().to_string())?;

        let args_value = match lua.to_value(args_snapshot)? {
            mlua::Value::Table(table) => mlua::Value::Table(read_only_view(lua, table)?),
            other => other,
        };
        lg.set("args", args_value)?;

        let runtime = self.runtime.clone();
        lg.set(
            "map_store",
            lua.create_function(move |lua, (key, value): (String, mlua::Value)| {
                runtime.shared_map.store(key, lua.from_value(value)?);
                Ok(())
            })?,
        )?;
        let runtime = self.runtime.clone();
        lg.set(
            "map_load",
            lua.create_function(move |lua, key: String| {
                match runtime.shared_map.load(&key) {
                    Some(value) => lua.to_value(&value),
                    None => Ok(mlua::Value::Nil),
                }
            })?,
        )?;
        let runtime = self.runtime.clone();
        lg.set(
            "map_add",
            lua.create_function(move |_, (key, delta): (String, f64)| {
                Ok(runtime.shared_map.add(key, delta))
            })?,
        )?;

        let runtime = self.runtime.clone();
        lg.set(
            "set_tick_data_file",
            lua.create_function(move |_, path: String| {
                runtime.tick_data.set_file(path);
                Ok(())
            })?,
        )?;

        let cancel = self.context.cancel.clone();
        lg.set(
            "should_quit",
            lua.create_function(move |_, ()| Ok(cancel.is_cancelled()))?,
        )?;

        let started = self.started.clone();
        lg.set(
            "begin",
            lua.create_function(move |_, keys: Variadic<String>| {
                let mut map = started.lock();
                for key in keys {
                    map.insert(key, Instant::now());
                }
                Ok(())
            })?,
        )?;

        lg.set(
            "end_metrics",
            self.custom_metrics_recorder(lua, false)?,
        )?;
        lg.set(
            "end_with_error",
            self.custom_metrics_recorder(lua, true)?,
        )?;

        let started = self.started.clone();
        lg.set(
            "abort",
            lua.create_function(move |_, keys: Variadic<String>| {
                let mut map = started.lock();
                for key in keys {
                    map.remove(&key);
                }
                Ok(())
            })?,
        )?;

        let stats = self.context.stats.clone();
        lg.set(
            "record_raw",
            lua.create_async_function(move |_, (key, value): (String, u64)| {
                let stats = stats.clone();
                async move {
                    let mut record = TraceRecord::new(TraceKind::Raw, "raw", key);
                    record.duration = std::time::Duration::from_nanos(value);
                    stats.record(record).await;
                    Ok(())
                }
            })?,
        )?;

        lg.set(
            "log_info",
            lua.create_function(|_, message: String| {
                tracing::info!("{message}");
                Ok(())
            })?,
        )?;
        lg.set(
            "log_debug",
            lua.create_function(|_, message: String| {
                tracing::debug!("{message}");
                Ok(())
            })?,
        )?;
        lg.set(
            "log_warn",
            lua.create_function(|_, message: String| {
                tracing::warn!("{message}");
                Ok(())
            })?,
        )?;

        lua.globals().set("lg", lg)?;
        lua.globals().set("surge", self.adapter_factories(lua)?)?;
        Ok(())
    }

    fn custom_metrics_recorder<'lua>(
        &self,
        lua: &'lua Lua,
        error: bool,
    ) -> anyhow::Result<Function<'lua>> {
        let started = self.started.clone();
        let stats = self.context.stats.clone();
        Ok(lua.create_async_function(move |_, keys: Variadic<String>| {
            let started = started.clone();
            let stats = stats.clone();
            async move {
                let mut missing = Vec::new();
                for key in keys {
                    let begun = started.lock().remove(&key);
                    match begun {
                        Some(at) => {
                            let mut record =
                                TraceRecord::new(TraceKind::Custom, "custom", key);
                            if error {
                                record.error = true;
                            } else {
                                record.duration = at.elapsed();
                            }
                            stats.record(record).await;
                        }
                        None => missing.push(key),
                    }
                }
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(mlua::Error::RuntimeError(format!(
                        "custom metrics keys missing: {}",
                        missing.join(" ")
                    )))
                }
            }
        })?)
    }

    /// Per-protocol constructors: `surge.http(opts)` builds and initializes
    /// an adapter inline and returns a handle exposing the tick contract.
    fn adapter_factories<'lua>(&self, lua: &'lua Lua) -> anyhow::Result<Table<'lua>> {
        let factories = lua.create_table()?;

        macro_rules! factory {
            ($name:literal, $options:ty, $build:expr) => {{
                let context = self.context.clone();
                let runtime = self.runtime.clone();
                factories.set(
                    $name,
                    lua.create_async_function(move |lua, options: mlua::Value| {
                        let context = context.clone();
                        let runtime = runtime.clone();
                        async move {
                            let options: $options = match options {
                                mlua::Value::Nil => Default::default(),
                                value => lua.from_value(value)?,
                            };
                            #[allow(clippy::redundant_closure_call)]
                            let mut generator: Box<dyn Generator> =
                                ($build)(context, runtime, options);
                            generator
                                .init()
                                .await
                                .map_err(mlua::Error::external)?;
                            Ok(LuaAdapter::new(generator))
                        }
                    })?,
                )?;
            }};
        }

        factory!("http", HttpOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(HttpGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("grpc", GrpcOptions, |context,
                                       runtime: Arc<ScriptRuntime>,
                                       options| {
            Box::new(GrpcGenerator::new(context, options, runtime.grpc_share.clone()))
                as Box<dyn Generator>
        });
        factory!("mysql", MysqlOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(MysqlGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("psql", PsqlOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(PsqlGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("clickhouse", ClickhouseOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(ClickhouseGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("cql", CqlOptions, |context,
                                     runtime: Arc<ScriptRuntime>,
                                     options| {
            Box::new(CqlGenerator::new(context, options, runtime.cql_share.clone()))
                as Box<dyn Generator>
        });
        factory!("redis", RedisOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(RedisGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("mongo", MongoOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(MongoGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("kafka", KafkaOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(KafkaGenerator::new(context, options)) as Box<dyn Generator>
        });
        factory!("smtp", SmtpOptions, |context, _runtime: Arc<ScriptRuntime>, options| {
            Box::new(SmtpGenerator::new(context, options)) as Box<dyn Generator>
        });

        Ok(factories)
    }
}

#[async_trait::async_trait]
impl Generator for ScriptGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        let snapshot = {
            let mut guard = self.runtime.frozen_args.lock().await;
            match guard.as_ref() {
                Some(value) => value.clone(),
                None => {
                    let value = self.evaluate_args().await?;
                    *guard = Some(value.clone());
                    value
                }
            }
        };

        let lua = Lua::new();
        self.install_api(&lua, &snapshot)?;
        lua.load(&self.runtime.source)
            .set_name(self.runtime.script.display().to_string())
            .exec_async()
            .await
            .map_err(|err| anyhow::anyhow!("lua: execution failed: {err}"))?;

        // Keep every borrow of the state inside this block so it can be
        // stored afterwards; only 'static registry keys escape.
        {
            let globals = lua.globals();
            let tick: mlua::Value = globals.get("tick")?;
            let tick = match tick {
                mlua::Value::Function(function) => function,
                _ => anyhow::bail!("lua: tick function is not defined or is not a function type"),
            };
            self.tick_fn = Some(lua.create_registry_value(tick)?);

            let finish: mlua::Value = globals.get("finish")?;
            self.finish_fn = match finish {
                mlua::Value::Nil => None,
                mlua::Value::Function(function) => Some(lua.create_registry_value(function)?),
                _ => anyhow::bail!("lua: finish is not a function"),
            };

            let init: mlua::Value = globals.get("init")?;
            match init {
                mlua::Value::Nil => {}
                mlua::Value::Function(function) => {
                    let ret: mlua::Value = function
                        .call_async(())
                        .await
                        .map_err(|err| anyhow::anyhow!("init function execution failed: {err}"))?;
                    if !ret.is_nil() {
                        anyhow::bail!("script initialization failed");
                    }
                }
                _ => anyhow::bail!("lua: init is not a function"),
            }
        }

        self.lua = Some(lua);
        Ok(())
    }

    async fn init_done(&mut self) -> anyhow::Result<()> {
        self.runtime.tick_data.open()
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let lua = self.lua.as_ref().context("script not initialized")?;
        let key = self.tick_fn.as_ref().context("script not initialized")?;
        let tick: Function = lua.registry_value(key)?;

        let argument = match self.runtime.tick_data.next() {
            None => mlua::Value::Nil,
            Some(TickData::Line(line)) => mlua::Value::String(lua.create_string(&line)?),
            Some(TickData::Row(row)) => {
                let table = lua.create_table()?;
                for (i, cell) in row.iter().enumerate() {
                    table.set(i + 1, cell.clone())?;
                }
                mlua::Value::Table(table)
            }
        };

        let ret: mlua::Value = tick
            .call_async(argument)
            .await
            .map_err(|err| anyhow::anyhow!("tick function execution failed: {err}"))?;
        if !ret.is_nil() {
            anyhow::bail!(
                "script tick function asking to quit ({})",
                ret.to_string().unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        self.runtime.tick_data.close();
        let (Some(lua), Some(key)) = (self.lua.as_ref(), self.finish_fn.as_ref()) else {
            return Ok(());
        };
        let finish: Function = lua.registry_value(key)?;
        finish
            .call_async::<_, ()>(())
            .await
            .map_err(|err| anyhow::anyhow!("lua: finish function execution failed: {err}"))?;
        Ok(())
    }
}

/// Reject creation of new keys on `table`. Used on the global table during
/// the args phase so that phase cannot smuggle state into workers.
fn freeze_table(lua: &Lua, table: &Table) -> mlua::Result<()> {
    let meta = lua.create_table()?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: Variadic<mlua::Value>| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError("modifying readonly table".into()))
        })?,
    )?;
    table.set_metatable(Some(meta));
    Ok(())
}

/// Wrap a table in a fully read-only view: reads pass through, every write
/// raises, including writes to existing keys.
fn read_only_view<'lua>(lua: &'lua Lua, table: Table<'lua>) -> mlua::Result<Table<'lua>> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set("__index", table)?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: Variadic<mlua::Value>| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError("modifying readonly table".into()))
        })?,
    )?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

/// Script-visible handle over an initialized adapter.
struct LuaAdapter {
    inner: Arc<tokio::sync::Mutex<Box<dyn Generator>>>,
}

impl LuaAdapter {
    fn new(generator: Box<dyn Generator>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(generator)),
        }
    }
}

impl UserData for LuaAdapter {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_async_method("init_done", |_, this, ()| {
            let inner = this.inner.clone();
            async move {
                inner
                    .lock()
                    .await
                    .init_done()
                    .await
                    .map_err(mlua::Error::external)
            }
        });
        methods.add_async_method("tick", |_, this, ()| {
            let inner = this.inner.clone();
            async move {
                inner
                    .lock()
                    .await
                    .tick()
                    .await
                    .map_err(mlua::Error::external)
            }
        });
        methods.add_async_method("finish", |_, this, ()| {
            let inner = this.inner.clone();
            async move {
                inner
                    .lock()
                    .await
                    .finish()
                    .await
                    .map_err(mlua::Error::external)
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use std::io::Write;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn write_script(source: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.lua");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        (dir, path)
    }

    fn generator(path: PathBuf, args: Vec<String>) -> (ScriptGenerator, Stats) {
        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        let context = WorkerContext {
            id: 1,
            requestrate: 1,
            concurrency: 1,
            cancel: CancellationToken::new(),
            stats: stats.clone(),
        };
        let runtime = ScriptRuntime::load(ScriptOptions { script: path, args }).unwrap();
        (ScriptGenerator::new(context, runtime), stats)
    }

    #[tokio::test]
    async fn lifecycle_records_custom_metrics() {
        let (_dir, path) = write_script(
            r#"
            function init() end
            function tick(data)
                lg.begin("work")
                lg.end_metrics("work")
                lg.record_raw("calls", 1500)
            end
            function finish() end
            "#,
        );
        let (mut generator, stats) = generator(path, vec![]);
        generator.init().await.unwrap();
        generator.init_done().await.unwrap();
        for _ in 0..3 {
            generator.tick().await.unwrap();
        }
        generator.finish().await.unwrap();

        let report = stats.export().await.unwrap();
        let custom = report
            .results
            .iter()
            .find(|r| r.kind == TraceKind::Custom)
            .unwrap();
        assert_eq!(custom.subtarget, "work");
        assert_eq!(custom.histogram.count, 3);
        let raw = report
            .results
            .iter()
            .find(|r| r.kind == TraceKind::Raw)
            .unwrap();
        assert_eq!(raw.histogram.count, 3);
    }

    #[tokio::test]
    async fn args_table_is_read_only() {
        let (_dir, path) = write_script(
            r#"
            function args(argv)
                return { name = argv[1] or "default" }
            end
            function tick(data)
                lg.args.name = "mutated"
            end
            "#,
        );
        let (mut generator, _stats) = generator(path, vec!["profile-a".into()]);
        generator.init().await.unwrap();

        let err = generator.tick().await.unwrap_err();
        assert!(err.to_string().contains("tick function execution failed"));
    }

    #[tokio::test]
    async fn args_are_passed_through() {
        let (_dir, path) = write_script(
            r#"
            function args(argv)
                return { first = argv[1] }
            end
            function tick(data)
                if lg.args.first ~= "alpha" then
                    return "wrong args"
                end
            end
            "#,
        );
        let (mut generator, _stats) = generator(path, vec!["alpha".into()]);
        generator.init().await.unwrap();
        generator.tick().await.unwrap();
    }

    #[tokio::test]
    async fn non_nil_tick_return_stops_the_worker() {
        let (_dir, path) = write_script("function tick(data) return 'done' end");
        let (mut generator, _stats) = generator(path, vec![]);
        generator.init().await.unwrap();
        let err = generator.tick().await.unwrap_err();
        assert!(err.to_string().contains("asking to quit"));
    }

    #[tokio::test]
    async fn missing_tick_fails_init() {
        let (_dir, path) = write_script("function init() end");
        let (mut generator, _stats) = generator(path, vec![]);
        assert!(generator.init().await.is_err());
    }

    #[tokio::test]
    async fn tick_data_reaches_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("users.txt");
        std::fs::write(&data, "alice\nbob\n").unwrap();
        let script = dir.path().join("load.lua");
        std::fs::write(
            &script,
            format!(
                r#"
                lg.set_tick_data_file("{}")
                seen = {{}}
                function tick(data)
                    table.insert(seen, data)
                    lg.map_add("rows", 1)
                end
                "#,
                data.display()
            ),
        )
        .unwrap();

        let (mut generator, _stats) = generator(script, vec![]);
        generator.init().await.unwrap();
        generator.init_done().await.unwrap();
        for _ in 0..3 {
            generator.tick().await.unwrap();
        }
        // wrapped around after two lines
        assert_eq!(generator.runtime.shared_map.add("rows".into(), 0.0), 3.0);
    }
}
