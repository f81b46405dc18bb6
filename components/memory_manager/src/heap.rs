//! Reference-counted heap for string, array, and object payloads.
//!
//! The heap is a slot arena owned by a single VM instance. Each slot
//! carries a reference count; `retain` and `release` are the only ways a
//! count changes. A slot is freed the moment its count reaches zero, and
//! freeing a container recursively releases its children.
//!
//! The heap is single-threaded: only the scheduler's execution context
//! ever touches it, so no synchronization is needed.

use core_types::{ErrorKind, Value};

/// A heap-allocated payload.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapValue {
    /// Immutable UTF-8 string. String operations always allocate new
    /// storage; an existing `Str` slot is never mutated.
    Str(String),
    /// Growable array of values. The array owns one count on each element.
    Array(Vec<Value>),
    /// Ordered field map. The object owns one count on each field value.
    Object(Vec<(String, Value)>),
}

#[derive(Debug)]
struct Slot {
    refcount: usize,
    value: HeapValue,
}

/// The reference-counted slot arena.
///
/// Slot ids are indices into the arena; a freed slot goes on the free
/// list and may be reused, but only after every holder has released it,
/// so a live `Value` never observes a recycled id.
///
/// # Examples
///
/// ```
/// use memory_manager::Heap;
///
/// let mut heap = Heap::new();
/// let s = heap.alloc_str("hello");
/// assert_eq!(heap.get_str(&s).unwrap(), "hello");
/// assert_eq!(heap.live_objects(), 1);
/// heap.release(s);
/// assert_eq!(heap.live_objects(), 0);
/// ```
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
}

impl Heap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, value: HeapValue) -> usize {
        let slot = Slot { refcount: 1, value };
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// Allocates a string and returns a `Value::Str` owning one count.
    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        Value::Str(self.alloc(HeapValue::Str(s.into())))
    }

    /// Allocates an array, taking ownership of the element counts.
    pub fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        Value::Array(self.alloc(HeapValue::Array(items)))
    }

    /// Allocates an object, taking ownership of the field value counts.
    pub fn alloc_object(&mut self, fields: Vec<(String, Value)>) -> Value {
        Value::Object(self.alloc(HeapValue::Object(fields)))
    }

    /// Increments the count behind `value`, if it references the heap.
    ///
    /// Call this when copying a value into an additional live location
    /// (stack slot, local, global, container element).
    pub fn retain(&mut self, value: &Value) {
        if let Some(id) = value.heap_id() {
            if let Some(slot) = self.slots.get_mut(id).and_then(Option::as_mut) {
                slot.refcount += 1;
            } else {
                debug_assert!(false, "retain on freed slot {id}");
            }
        }
    }

    /// Releases one count behind `value`, freeing the slot at zero.
    ///
    /// Freeing a container releases its children recursively. Releasing a
    /// scalar is a no-op, so call sites can release unconditionally.
    pub fn release(&mut self, value: Value) {
        let mut work = vec![value];
        while let Some(v) = work.pop() {
            let id = match v.heap_id() {
                Some(id) => id,
                None => continue,
            };
            let dead = match self.slots.get_mut(id).and_then(Option::as_mut) {
                Some(slot) => {
                    slot.refcount -= 1;
                    slot.refcount == 0
                }
                None => {
                    debug_assert!(false, "release on freed slot {id}");
                    false
                }
            };
            if dead {
                if let Some(slot) = self.slots[id].take() {
                    match slot.value {
                        HeapValue::Str(_) => {}
                        HeapValue::Array(items) => work.extend(items),
                        HeapValue::Object(fields) => {
                            work.extend(fields.into_iter().map(|(_, v)| v))
                        }
                    }
                    self.free.push(id);
                }
            }
        }
    }

    /// Current reference count of a slot, or `None` if freed.
    pub fn refcount(&self, id: usize) -> Option<usize> {
        self.slots.get(id).and_then(Option::as_ref).map(|s| s.refcount)
    }

    /// Number of live heap objects. Used by leak assertions.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn slot(&self, id: usize) -> Result<&HeapValue, ErrorKind> {
        self.slots
            .get(id)
            .and_then(Option::as_ref)
            .map(|s| &s.value)
            .ok_or_else(|| ErrorKind::Internal(format!("access to freed heap slot {id}")))
    }

    /// Borrows the string behind a `Value::Str`.
    pub fn get_str(&self, value: &Value) -> Result<&str, ErrorKind> {
        match value {
            Value::Str(id) => match self.slot(*id)? {
                HeapValue::Str(s) => Ok(s),
                _ => Err(ErrorKind::Internal(format!("slot {id} is not a string"))),
            },
            other => Err(ErrorKind::TypeMismatch(format!(
                "expected string, got {}",
                other.type_name()
            ))),
        }
    }

    /// Length of the array behind a `Value::Array`.
    pub fn array_len(&self, value: &Value) -> Result<usize, ErrorKind> {
        match value {
            Value::Array(id) => match self.slot(*id)? {
                HeapValue::Array(items) => Ok(items.len()),
                _ => Err(ErrorKind::Internal(format!("slot {id} is not an array"))),
            },
            other => Err(ErrorKind::TypeMismatch(format!(
                "expected array, got {}",
                other.type_name()
            ))),
        }
    }

    /// Reads `container[index]`, returning a retained copy of the element.
    ///
    /// Arrays index by integer, objects by string key. An out-of-bounds
    /// index or missing key is `IndexOutOfRange`.
    pub fn index_get(&mut self, container: &Value, index: &Value) -> Result<Value, ErrorKind> {
        let elem = match (container, index) {
            (Value::Array(id), Value::Int(i)) => match self.slot(*id)? {
                HeapValue::Array(items) => {
                    let idx = usize::try_from(*i)
                        .ok()
                        .filter(|idx| *idx < items.len())
                        .ok_or_else(|| {
                            ErrorKind::IndexOutOfRange(format!(
                                "index {i} on array of length {}",
                                items.len()
                            ))
                        })?;
                    items[idx].clone()
                }
                _ => return Err(ErrorKind::Internal(format!("slot {id} is not an array"))),
            },
            (Value::Object(id), Value::Str(key_id)) => {
                let key = match self.slot(*key_id)? {
                    HeapValue::Str(s) => s.clone(),
                    _ => {
                        return Err(ErrorKind::Internal(format!(
                            "slot {key_id} is not a string"
                        )))
                    }
                };
                self.field_ref(*id, &key)?.clone()
            }
            (c, i) => {
                return Err(ErrorKind::TypeMismatch(format!(
                    "cannot index {} with {}",
                    c.type_name(),
                    i.type_name()
                )))
            }
        };
        self.retain(&elem);
        Ok(elem)
    }

    /// Writes `container[index] = value`, taking ownership of `value`'s
    /// count and releasing the overwritten element.
    ///
    /// Array writes must stay in bounds; object writes insert the key if
    /// absent.
    pub fn index_set(
        &mut self,
        container: &Value,
        index: &Value,
        value: Value,
    ) -> Result<(), ErrorKind> {
        // Validate before mutating so the incoming count can be released
        // on every error path.
        let fault = match (container, index) {
            (Value::Array(id), Value::Int(i)) => {
                match self.slot(*id) {
                    Ok(HeapValue::Array(items)) => {
                        let len = items.len();
                        match usize::try_from(*i).ok().filter(|idx| *idx < len) {
                            Some(idx) => {
                                let id = *id;
                                if let Some(Slot {
                                    value: HeapValue::Array(items),
                                    ..
                                }) = self.slots.get_mut(id).and_then(Option::as_mut)
                                {
                                    let old = std::mem::replace(&mut items[idx], value);
                                    self.release(old);
                                    return Ok(());
                                }
                                ErrorKind::Internal(format!("slot {id} is not an array"))
                            }
                            None => ErrorKind::IndexOutOfRange(format!(
                                "index {i} on array of length {len}"
                            )),
                        }
                    }
                    Ok(_) => ErrorKind::Internal(format!("slot {id} is not an array")),
                    Err(e) => e,
                }
            }
            (Value::Object(id), Value::Str(key_id)) => match self.slot(*key_id) {
                Ok(HeapValue::Str(s)) => {
                    let key = s.clone();
                    return self.field_set(&Value::Object(*id), &key, value);
                }
                Ok(_) => ErrorKind::Internal(format!("slot {key_id} is not a string")),
                Err(e) => e,
            },
            (c, i) => ErrorKind::TypeMismatch(format!(
                "cannot index {} with {}",
                c.type_name(),
                i.type_name()
            )),
        };
        self.release(value);
        Err(fault)
    }

    /// Reads a named field from an object, returning a retained copy.
    pub fn field_get(&mut self, container: &Value, name: &str) -> Result<Value, ErrorKind> {
        let id = match container {
            Value::Object(id) => *id,
            other => {
                return Err(ErrorKind::TypeMismatch(format!(
                    "expected object, got {}",
                    other.type_name()
                )))
            }
        };
        let elem = self.field_ref(id, name)?.clone();
        self.retain(&elem);
        Ok(elem)
    }

    /// Writes a named field on an object, inserting the key if absent.
    pub fn field_set(
        &mut self,
        container: &Value,
        name: &str,
        value: Value,
    ) -> Result<(), ErrorKind> {
        let id = match container {
            Value::Object(id) => *id,
            other => {
                self.release(value);
                return Err(ErrorKind::TypeMismatch(format!(
                    "expected object, got {}",
                    other.type_name()
                )));
            }
        };
        match self.put_field(id, name.to_string(), value) {
            Ok(Some(old)) => {
                self.release(old);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(value) => {
                self.release(value);
                Err(ErrorKind::Internal(format!("slot {id} is not an object")))
            }
        }
    }

    fn field_ref(&self, id: usize, name: &str) -> Result<&Value, ErrorKind> {
        match self.slot(id)? {
            HeapValue::Object(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
                .ok_or_else(|| ErrorKind::IndexOutOfRange(format!("no field '{name}'"))),
            _ => Err(ErrorKind::Internal(format!("slot {id} is not an object"))),
        }
    }

    // On error the unconsumed value comes back so the caller can
    // release it.
    fn put_field(&mut self, id: usize, name: String, value: Value) -> Result<Option<Value>, Value> {
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(Slot {
                value: HeapValue::Object(fields),
                ..
            }) => {
                if let Some((_, existing)) = fields.iter_mut().find(|(k, _)| *k == name) {
                    Ok(Some(std::mem::replace(existing, value)))
                } else {
                    fields.push((name, value));
                    Ok(None)
                }
            }
            _ => Err(value),
        }
    }

    /// Deep structural equality.
    ///
    /// Numbers compare across `Int`/`Float` with promotion, strings by
    /// content, arrays elementwise, objects by key set (order does not
    /// matter). All other cross-type comparisons are unequal. A container
    /// pair already being compared higher up the walk compares equal, so
    /// self-referential data terminates.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.equal_inner(a, b, &mut Vec::new())
    }

    fn equal_inner(&self, a: &Value, b: &Value, in_progress: &mut Vec<(usize, usize)>) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
                *x as f64 == *y
            }
            (Value::Str(x), Value::Str(y)) => {
                match (self.slot(*x), self.slot(*y)) {
                    (Ok(HeapValue::Str(s1)), Ok(HeapValue::Str(s2))) => s1 == s2,
                    _ => false,
                }
            }
            (Value::Array(x), Value::Array(y)) => {
                if x == y || in_progress.contains(&(*x, *y)) {
                    return true;
                }
                match (self.slot(*x), self.slot(*y)) {
                    (Ok(HeapValue::Array(i1)), Ok(HeapValue::Array(i2))) => {
                        if i1.len() != i2.len() {
                            return false;
                        }
                        in_progress.push((*x, *y));
                        let equal = i1
                            .iter()
                            .zip(i2)
                            .all(|(a, b)| self.equal_inner(a, b, in_progress));
                        in_progress.pop();
                        equal
                    }
                    _ => false,
                }
            }
            (Value::Object(x), Value::Object(y)) => {
                if x == y || in_progress.contains(&(*x, *y)) {
                    return true;
                }
                match (self.slot(*x), self.slot(*y)) {
                    (Ok(HeapValue::Object(f1)), Ok(HeapValue::Object(f2))) => {
                        if f1.len() != f2.len() {
                            return false;
                        }
                        in_progress.push((*x, *y));
                        let equal = f1.iter().all(|(k, v)| {
                            f2.iter()
                                .find(|(k2, _)| k2 == k)
                                .is_some_and(|(_, v2)| self.equal_inner(v, v2, in_progress))
                        });
                        in_progress.pop();
                        equal
                    }
                    _ => false,
                }
            }
            (Value::Function(x), Value::Function(y)) => x == y,
            (Value::Agent(x), Value::Agent(y)) => x == y,
            _ => false,
        }
    }

    /// Truthiness including heap payloads: empty strings are falsy,
    /// arrays and objects are always truthy.
    pub fn truthy(&self, value: &Value) -> bool {
        if let Some(b) = value.scalar_truthy() {
            return b;
        }
        match value {
            Value::Str(id) => matches!(self.slot(*id), Ok(HeapValue::Str(s)) if !s.is_empty()),
            _ => true,
        }
    }

    /// Renders a value for `print` and string conversion.
    ///
    /// A container reached again inside its own rendering shows as
    /// `[...]` or `{...}`.
    pub fn display(&self, value: &Value) -> String {
        self.display_inner(value, &mut Vec::new())
    }

    fn display_inner(&self, value: &Value, open: &mut Vec<usize>) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => {
                if n.is_nan() {
                    "nan".to_string()
                } else if n.is_infinite() {
                    if n.is_sign_positive() { "inf" } else { "-inf" }.to_string()
                } else if n.fract() == 0.0 && n.abs() < 1e15 {
                    // Integer-valued floats display without decimal point
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Str(id) => match self.slot(*id) {
                Ok(HeapValue::Str(s)) => s.clone(),
                _ => "<freed string>".to_string(),
            },
            Value::Array(id) => {
                if open.contains(id) {
                    return "[...]".to_string();
                }
                match self.slot(*id) {
                    Ok(HeapValue::Array(items)) => {
                        open.push(*id);
                        let parts: Vec<String> =
                            items.iter().map(|v| self.display_inner(v, open)).collect();
                        open.pop();
                        format!("[{}]", parts.join(", "))
                    }
                    _ => "<freed array>".to_string(),
                }
            }
            Value::Object(id) => {
                if open.contains(id) {
                    return "{...}".to_string();
                }
                match self.slot(*id) {
                    Ok(HeapValue::Object(fields)) => {
                        open.push(*id);
                        let parts: Vec<String> = fields
                            .iter()
                            .map(|(k, v)| format!("{}: {}", k, self.display_inner(v, open)))
                            .collect();
                        open.pop();
                        format!("{{{}}}", parts.join(", "))
                    }
                    _ => "<freed object>".to_string(),
                }
            }
            Value::Function(idx) => format!("<function {idx}>"),
            Value::Agent(pid) => format!("<agent {pid}>"),
        }
    }

    /// Concatenates two strings into new storage.
    pub fn concat(&mut self, a: &Value, b: &Value) -> Result<Value, ErrorKind> {
        let joined = format!("{}{}", self.get_str(a)?, self.get_str(b)?);
        Ok(self.alloc_str(joined))
    }

    /// Copies `len` characters starting at `start` into a new string.
    ///
    /// `start` must lie within the string; `len` is clamped to the end.
    /// The source string is never altered.
    pub fn substr(&mut self, s: &Value, start: i64, len: i64) -> Result<Value, ErrorKind> {
        let source = self.get_str(s)?;
        let chars: Vec<char> = source.chars().collect();
        let start = usize::try_from(start)
            .ok()
            .filter(|i| *i <= chars.len())
            .ok_or_else(|| {
                ErrorKind::IndexOutOfRange(format!(
                    "substr start {start} on string of length {}",
                    chars.len()
                ))
            })?;
        let len = usize::try_from(len.max(0)).unwrap_or(0).min(chars.len() - start);
        let out: String = chars[start..start + len].iter().collect();
        Ok(self.alloc_str(out))
    }

    /// Splits a string on a separator, returning a new array of new
    /// strings.
    pub fn split(&mut self, s: &Value, separator: &Value) -> Result<Value, ErrorKind> {
        let parts: Vec<String> = {
            let source = self.get_str(s)?;
            let sep = self.get_str(separator)?;
            if sep.is_empty() {
                source.chars().map(String::from).collect()
            } else {
                source.split(sep).map(String::from).collect()
            }
        };
        let items: Vec<Value> = parts.into_iter().map(|p| self.alloc_str(p)).collect();
        Ok(self.alloc_array(items))
    }
}
