//! Native methods of `io.recordbuf.RecordBuffer`.
//!
//! A Java handle is a boxed [`Engine`] turned into a `long`. It stays valid
//! until `close` is called with it. Failures are raised as
//! `IllegalStateException`.

use std::error::Error;
use std::fmt::Display;
use std::ptr;

use jni::objects::{JByteArray, JByteBuffer, JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jbyteArray, jint, jlong, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use serde::{Deserialize, Serialize};

use recordbuf::core::{writer_context, ShmemConfig, ShmemService};
use recordbuf::region::WORD_SIZE;
use recordbuf::{RawRegion, RecordBufError, RecordBuffer};

pub const DID_NOT_CLAIM_RECORD: jint = -1;

const ILLEGAL_STATE: &str = "java/lang/IllegalStateException";

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct JniConfig {
    pub shmem: ShmemConfig,
}

impl JniConfig {
    fn into_shmem(self) -> Result<ShmemConfig, RecordBufError> {
        let mut shmem = self.shmem;
        // The JVM installs its own SIGQUIT handler.
        shmem.handle_signals = false;
        if shmem.capacity > jint::MAX as usize {
            return Err(RecordBufError::Config(format!(
                "capacity {} does not fit a Java int offset",
                shmem.capacity
            )));
        }
        shmem.validate()?;
        Ok(shmem)
    }
}

/// A record buffer over either a Java direct buffer or a shared segment.
pub enum Engine {
    Direct(RecordBuffer<RawRegion>),
    Shared(ShmemService),
}

macro_rules! with_buffer {
    ($engine:expr, $buffer:ident => $body:expr) => {
        match $engine {
            Engine::Direct($buffer) => $body,
            Engine::Shared(service) => {
                let $buffer = service.buffer();
                $body
            }
        }
    };
}

impl Engine {
    pub fn open(shmem: &ShmemConfig) -> Result<Engine, RecordBufError> {
        let region = writer_context(shmem)?;
        Ok(Engine::Shared(ShmemService::new(region, shmem)?))
    }

    pub fn initialise(&self) -> bool {
        with_buffer!(self, buffer => buffer.initialise())
    }

    pub fn claim(&self, key: i32) -> jint {
        with_buffer!(self, buffer => match buffer.claim(key) {
            Ok(offset) => offset as jint,
            Err(_) => DID_NOT_CLAIM_RECORD,
        })
    }

    pub fn commit(&self, offset: jint) -> Result<(), RecordBufError> {
        let offset = self.payload_offset(offset)?;
        with_buffer!(self, buffer => buffer.commit(offset))
    }

    pub fn with_record(&self, key: i32, payload: &[u8]) -> Result<bool, RecordBufError> {
        with_buffer!(self, buffer => {
            buffer.try_with_record(key, |offset| buffer.write_payload(offset, payload))
        })
    }

    pub fn for_each(&self, handler: &mut dyn FnMut(i32, jint)) {
        with_buffer!(self, buffer => buffer.for_each(|key, offset| handler(key, offset as jint)))
    }

    pub fn read_record(&self, offset: jint) -> Result<Vec<u8>, RecordBufError> {
        let offset = self.payload_offset(offset)?;
        with_buffer!(self, buffer => {
            let mut payload = vec![0u8; buffer.record_size()];
            buffer.read_payload(offset, &mut payload);
            Ok(payload)
        })
    }

    pub fn close(&self) {
        if let Engine::Shared(service) = self {
            service.close();
        }
    }

    fn payload_offset(&self, offset: jint) -> Result<usize, RecordBufError> {
        let layout = with_buffer!(self, buffer => *buffer.layout());
        match usize::try_from(offset) {
            Ok(offset) if layout.is_payload_offset(offset) => Ok(offset),
            _ => Err(RecordBufError::Layout(format!(
                "{} is not a record offset",
                offset
            ))),
        }
    }
}

fn throw(env: &mut JNIEnv, err: impl Display) {
    // An exception already pending takes precedence.
    let _ = env.throw_new(ILLEGAL_STATE, err.to_string());
}

unsafe fn engine<'a>(env: &mut JNIEnv, engine_ptr: jlong) -> Option<&'a Engine> {
    if engine_ptr == 0 {
        throw(env, "record buffer is closed");
        None
    } else {
        Some(&*(engine_ptr as *const Engine))
    }
}

fn into_handle(env: &mut JNIEnv, engine: Result<Engine, Box<dyn Error>>) -> jlong {
    match engine {
        Ok(engine) => Box::into_raw(Box::new(engine)) as jlong,
        Err(e) => {
            throw(env, e);
            0
        }
    }
}

fn wrap(
    env: &mut JNIEnv, buffer: &JByteBuffer, header_size: jint, record_size: jint,
) -> Result<Engine, Box<dyn Error>> {
    let address = env.get_direct_buffer_address(buffer)?;
    let capacity = env.get_direct_buffer_capacity(buffer)?;
    if address.is_null() || address as usize % WORD_SIZE != 0 {
        return Err(Box::new(RecordBufError::Layout(
            "direct buffer must be 4-byte aligned".to_string(),
        )));
    }
    let header_size = usize::try_from(header_size)?;
    let record_size = usize::try_from(record_size)?;
    // The Java side keeps the ByteBuffer reachable until close.
    let region = unsafe { RawRegion::from_raw(address, capacity) };
    Ok(Engine::Direct(RecordBuffer::new(region, header_size, record_size)?))
}

fn open(env: &mut JNIEnv, config_path: &JString) -> Result<Engine, Box<dyn Error>> {
    let config_path: String = env.get_string(config_path)?.into();
    let cfg: JniConfig = confy::load_path(config_path)?;
    Ok(Engine::open(&cfg.into_shmem()?)?)
}

fn open_toml(env: &mut JNIEnv, config: &JString) -> Result<Engine, Box<dyn Error>> {
    let config: String = env.get_string(config)?.into();
    let cfg: JniConfig = toml::from_str(&config)?;
    Ok(Engine::open(&cfg.into_shmem()?)?)
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_wrap(
    mut env: JNIEnv, _class: JClass, j_buffer: JByteBuffer, header_size: jint, record_size: jint,
) -> jlong {
    let engine = wrap(&mut env, &j_buffer, header_size, record_size);
    into_handle(&mut env, engine)
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_open(
    mut env: JNIEnv, _class: JClass, j_config_path: JString,
) -> jlong {
    let engine = open(&mut env, &j_config_path);
    into_handle(&mut env, engine)
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_openToml(
    mut env: JNIEnv, _class: JClass, j_config: JString,
) -> jlong {
    let engine = open_toml(&mut env, &j_config);
    into_handle(&mut env, engine)
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_initialise(
    mut env: JNIEnv, _class: JClass, engine_ptr: jlong,
) {
    if let Some(engine) = engine(&mut env, engine_ptr) {
        engine.initialise();
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_claimRecord(
    mut env: JNIEnv, _class: JClass, engine_ptr: jlong, key: jint,
) -> jint {
    match engine(&mut env, engine_ptr) {
        Some(engine) => engine.claim(key),
        None => DID_NOT_CLAIM_RECORD,
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_commit(
    mut env: JNIEnv, _class: JClass, engine_ptr: jlong, offset: jint,
) {
    if let Some(engine) = engine(&mut env, engine_ptr) {
        if let Err(e) = engine.commit(offset) {
            throw(&mut env, e);
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_withRecord(
    mut env: JNIEnv, _class: JClass, engine_ptr: jlong, key: jint, j_payload: JByteArray,
) -> jboolean {
    let engine = match engine(&mut env, engine_ptr) {
        Some(engine) => engine,
        None => return JNI_FALSE,
    };
    let written = env
        .convert_byte_array(&j_payload)
        .map_err(|e| e.to_string())
        .and_then(|payload| engine.with_record(key, &payload).map_err(|e| e.to_string()));
    match written {
        Ok(true) => JNI_TRUE,
        Ok(false) => JNI_FALSE,
        Err(e) => {
            throw(&mut env, e);
            JNI_FALSE
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_forEach(
    mut env: JNIEnv, _class: JClass, engine_ptr: jlong, j_handler: JObject,
) {
    let engine = match engine(&mut env, engine_ptr) {
        Some(engine) => engine,
        None => return,
    };
    // Stop calling back once the handler has thrown.
    let mut failed = false;
    engine.for_each(&mut |key, offset| {
        if failed {
            return;
        }
        let args = [JValue::Int(key), JValue::Int(offset)];
        failed = env.call_method(&j_handler, "onRecord", "(II)V", &args).is_err();
    });
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_readRecord(
    mut env: JNIEnv, _class: JClass, engine_ptr: jlong, offset: jint,
) -> jbyteArray {
    let engine = match engine(&mut env, engine_ptr) {
        Some(engine) => engine,
        None => return ptr::null_mut(),
    };
    let payload = match engine.read_record(offset) {
        Ok(payload) => payload,
        Err(e) => {
            throw(&mut env, e);
            return ptr::null_mut();
        }
    };
    match env.byte_array_from_slice(&payload) {
        Ok(array) => array.into_raw(),
        Err(e) => {
            throw(&mut env, e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_io_recordbuf_RecordBuffer_close(
    _env: JNIEnv, _class: JClass, engine_ptr: jlong,
) {
    if engine_ptr != 0 {
        let engine = Box::from_raw(engine_ptr as *mut Engine);
        engine.close();
    }
}
