use std::{cell::RefCell, rc::Rc};

use loomir::{
    analysis::analyze_method,
    body::{Instr, InstrId, MethodBody},
    coder::{InsertionPosition, Operand},
    interp::{Interpreter, Value},
    program::{FieldDef, MethodDef, MethodId, MethodRef, Modifiers, ProgramUnit, TypeDef, TypeKind},
    types::Typeref,
};

struct Fixture {
    unit: ProgramUnit,
    exception: Typeref,
    write: MethodRef,
    object_ctor: MethodRef,
    target: MethodId,
}

/// `static int Shift(int x)`: throws for a negative `x`, returns `x + 10`
/// otherwise; `Test.Log::Write(int)` is served natively.
fn fixture() -> Fixture {
    let mut unit = ProgramUnit::new("coded");
    let object = unit.add_type(TypeDef::external("System.Object", TypeKind::Class)).unwrap();
    let object_ctor = unit.add_method(object, MethodDef::constructor()).unwrap();
    let object_ref = unit.type_ref(object).unwrap();
    let exc = unit
        .add_type(TypeDef::external("System.Exception", TypeKind::Class).with_base(object_ref))
        .unwrap();
    let exc_ctor = unit.add_method(exc, MethodDef::constructor()).unwrap();
    let log = unit.add_type(TypeDef::external("Test.Log", TypeKind::Class)).unwrap();
    let write = unit
        .add_method(
            log,
            MethodDef::ordinary("Write", Typeref::VOID)
                .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
                .with_param("v", Typeref::I32),
        )
        .unwrap();

    let throw = unit.method_ref(exc_ctor, None).unwrap();
    let mut body = MethodBody::new();
    body.push(Instr::LdArg(0));
    body.push(Instr::LdcI4(0));
    body.push(Instr::Clt);
    let skip = body.push(Instr::BrFalse(InstrId::default()));
    body.push(Instr::NewObj(throw));
    body.push(Instr::Throw);
    let tail = body.push(Instr::LdArg(0));
    body.push(Instr::LdcI4(10));
    body.push(Instr::Add);
    body.push(Instr::Ret);
    *body.get_mut(skip).unwrap() = Instr::BrFalse(tail);

    let ty = unit.add_type(TypeDef::new("Test.T", TypeKind::Class)).unwrap();
    let target = unit
        .add_method(
            ty,
            MethodDef::ordinary("Shift", Typeref::I32)
                .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
                .with_param("x", Typeref::I32)
                .with_body(body),
        )
        .unwrap();

    Fixture {
        exception: unit.type_ref(exc).unwrap(),
        write: unit.method_ref(write, None).unwrap(),
        object_ctor: unit.method_ref(object_ctor, None).unwrap(),
        unit,
        target,
    }
}

fn logging(unit: &ProgramUnit) -> (Interpreter<'_>, Rc<RefCell<Vec<i64>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut interp = Interpreter::new(unit);
    let sink = seen.clone();
    interp.register_native("Test.Log", "Write", move |_, args| {
        sink.borrow_mut().push(args[0].as_i64().unwrap_or(-1));
        Ok(Value::Null)
    });
    (interp, seen)
}

#[test]
fn wrapped_body_swallows_exceptions_into_the_default_value() {
    let mut fx = fixture();
    let (write, exception) = (fx.write.clone(), fx.exception);
    fx.unit
        .with_coder(fx.target, |c| {
            c.try_(|c| {
                c.call(None, write.clone(), &[Operand::I32(1)])?;
                c.original_body()?;
                Ok(())
            })?
            .catch(exception, |c| {
                c.call(None, write.clone(), &[Operand::I32(2)])?;
                c.return_default()?;
                Ok(())
            })?
            .finally(|c| {
                c.call(None, write.clone(), &[Operand::I32(3)])?;
                Ok(())
            })?
            .end_try()?;
            c.return_()?;
            c.replace()
        })
        .unwrap();
    analyze_method(&fx.unit, fx.target).unwrap();

    let (mut interp, seen) = logging(&fx.unit);
    let value = interp.call(fx.target, vec![Value::I32(5)]).unwrap().returned();
    assert_eq!(value, Some(Value::I32(15)));
    assert_eq!(*seen.borrow(), vec![1, 3]);

    seen.borrow_mut().clear();
    let value = interp.call(fx.target, vec![Value::I32(-5)]).unwrap().returned();
    assert_eq!(value, Some(Value::I32(0)));
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}

#[test]
fn rethrow_keeps_the_exception_identity() {
    let mut fx = fixture();
    let (write, exception) = (fx.write.clone(), fx.exception);
    fx.unit
        .with_coder(fx.target, |c| {
            c.try_(|c| {
                c.original_body()?;
                Ok(())
            })?
            .catch(exception, |c| {
                c.is_not_null(Operand::Exception)?
                    .then(|c| {
                        c.call(None, write.clone(), &[Operand::I32(7)])?;
                        Ok(())
                    })?
                    .end_if()?;
                c.rethrow()
            })?
            .end_try()?;
            c.return_()?;
            c.replace()
        })
        .unwrap();
    analyze_method(&fx.unit, fx.target).unwrap();

    let (mut interp, seen) = logging(&fx.unit);
    let thrown = interp.call(fx.target, vec![Value::I32(-1)]).unwrap().threw().unwrap();
    assert!(interp.is_instance(&thrown, fx.exception));
    assert_eq!(*seen.borrow(), vec![7]);
}

#[test]
fn lazy_guard_creates_its_field_once() {
    let mut fx = fixture();
    let ty = fx.unit.method(fx.target).unwrap().declaring_type;
    let object = fx.unit.registry.named("System.Object", false);
    let cache = fx
        .unit
        .add_field(ty, FieldDef::new("cache", object, Modifiers::PRIVATE | Modifiers::STATIC))
        .unwrap();
    let cache_ref = fx.unit.field_ref(cache, None).unwrap();
    let (body, _) = MethodBody::from_instrs([Instr::LdSFld(cache_ref), Instr::Ret]);
    let get = fx
        .unit
        .add_method(
            ty,
            MethodDef::ordinary("Get", object)
                .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
                .with_body(body),
        )
        .unwrap();

    let ctor = fx.object_ctor.clone();
    fx.unit
        .with_coder(get, |c| {
            c.is_null(Operand::Field(cache_ref))?
                .then(|c| c.assign(Operand::Field(cache_ref)).new_obj(ctor, &[]))?
                .end_if()?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();
    analyze_method(&fx.unit, get).unwrap();

    let mut interp = Interpreter::new(&fx.unit);
    let first = interp.call(get, Vec::new()).unwrap().returned().unwrap();
    let second = interp.call(get, Vec::new()).unwrap().returned().unwrap();
    assert!(first.is_obj());
    assert_eq!(first, second);
    assert_eq!(interp.static_value(cache), Some(first));
}

#[test]
fn argument_array_mirrors_the_parameters() {
    let mut fx = fixture();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let capture = {
        let log = fx.unit.type_by_name("Test.Log").unwrap();
        let array = fx.unit.registry.named("System.Object", false);
        let array = fx.unit.registry.array(array);
        let capture = fx
            .unit
            .add_method(
                log,
                MethodDef::ordinary("Capture", Typeref::VOID)
                    .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
                    .with_param("values", array),
            )
            .unwrap();
        fx.unit.method_ref(capture, None).unwrap()
    };
    fx.unit
        .with_coder(fx.target, |c| {
            c.call(None, capture, &[Operand::Arguments])?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();
    analyze_method(&fx.unit, fx.target).unwrap();

    let mut interp = Interpreter::new(&fx.unit);
    let sink = seen.clone();
    interp.register_native("Test.Log", "Capture", move |_, args| {
        if let Value::Array(values) = &args[0] {
            sink.borrow_mut().extend(values.borrow().iter().cloned());
        }
        Ok(Value::Null)
    });
    let value = interp.call(fx.target, vec![Value::I32(2)]).unwrap().returned();
    assert_eq!(value, Some(Value::I32(12)));
    assert_eq!(*seen.borrow(), vec![Value::I32(2)]);
}
